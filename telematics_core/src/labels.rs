//! Forward-looking claim labels for driver-period rows.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DriverPeriodRow;

pub const DEFAULT_WINDOW_DAYS: i64 = 90;
/// Longest label window accepted from settings (ten years).
pub const MAX_WINDOW_DAYS: i64 = 3660;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub policy_id: String,
    pub loss_dt: DateTime<Utc>,
    pub at_fault: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub row: DriverPeriodRow,
    pub label_claim_next90d: u8,
}

/// At-fault loss instants per policy, sorted ascending.
#[derive(Debug, Default)]
pub struct ClaimIndex {
    by_policy: HashMap<String, Vec<DateTime<Utc>>>,
}

impl ClaimIndex {
    pub fn new(claims: &[ClaimRecord]) -> Self {
        let mut by_policy: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
        for c in claims.iter().filter(|c| c.at_fault) {
            by_policy.entry(c.policy_id.clone()).or_default().push(c.loss_dt);
        }
        for losses in by_policy.values_mut() {
            losses.sort_unstable();
        }
        Self { by_policy }
    }

    /// Whether the policy has an at-fault loss in `(from, to]`.
    pub fn any_between(&self, policy_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let Some(losses) = self.by_policy.get(policy_id) else {
            return false;
        };
        let first_after = losses.partition_point(|t| *t <= from);
        losses.get(first_after).is_some_and(|t| *t <= to)
    }
}

/// Label each row 1 when an at-fault claim lands in
/// `(period_start, period_start + window_days]`.
pub fn label_rows(rows: &[DriverPeriodRow], claims: &[ClaimRecord], window_days: i64) -> Vec<LabeledRow> {
    let index = ClaimIndex::new(claims);
    let window = Duration::try_days(window_days);
    rows.iter()
        .map(|row| {
            let from = row
                .period_start
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or_default();
            let to = window
                .and_then(|w| from.checked_add_signed(w))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let hit = index.any_between(&row.policy_id, from, to);
            LabeledRow {
                row: row.clone(),
                label_claim_next90d: u8::from(hit),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn row(policy: &str, y: i32, m: u32) -> DriverPeriodRow {
        DriverPeriodRow {
            policy_id: policy.into(),
            period_start: NaiveDate::from_ymd_opt(y, m, 1).unwrap(),
            trip_ct: 1,
            exposure_miles: 1.0,
            duration_s: 60.0,
            harsh_brake_per_100mi: 0.0,
            overspeed_ratio: 0.0,
            night_ratio: 0.0,
            avg_overspeed_ratio: 0.0,
            night_miles_ratio: 0.0,
            phone_usage_per_hr: 0.0,
            mean_speed_mps: 10.0,
            miles_per_trip: 1.0,
            speed_var_across_trips: 0.0,
        }
    }

    fn claim(policy: &str, y: i32, m: u32, d: u32, at_fault: bool) -> ClaimRecord {
        ClaimRecord {
            policy_id: policy.into(),
            loss_dt: Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap(),
            at_fault,
        }
    }

    #[test]
    fn test_window_is_open_closed() {
        let rows = vec![row("P1", 2024, 1)];
        // exactly at period start: excluded
        let l = label_rows(&rows, &[claim("P1", 2024, 1, 1, true)], 90);
        assert_eq!(l[0].label_claim_next90d, 0);
        // exactly 90 days later (2024 is a leap year): included
        let l = label_rows(&rows, &[claim("P1", 2024, 3, 31, true)], 90);
        assert_eq!(l[0].label_claim_next90d, 1);
        let l = label_rows(&rows, &[claim("P1", 2024, 4, 1, true)], 90);
        assert_eq!(l[0].label_claim_next90d, 0);
    }

    #[test]
    fn test_only_at_fault_claims_of_same_policy_count() {
        let rows = vec![row("P1", 2024, 1), row("P2", 2024, 1)];
        let claims = vec![claim("P1", 2024, 2, 1, false), claim("P2", 2024, 2, 1, true)];
        let l = label_rows(&rows, &claims, 90);
        assert_eq!(l[0].label_claim_next90d, 0);
        assert_eq!(l[1].label_claim_next90d, 1);
    }

    #[test]
    fn test_binary_search_skips_earlier_losses() {
        let rows = vec![row("P1", 2024, 6)];
        let claims = vec![
            claim("P1", 2024, 1, 5, true),
            claim("P1", 2024, 7, 5, true),
            claim("P1", 2023, 3, 5, true),
        ];
        assert_eq!(label_rows(&rows, &claims, 90)[0].label_claim_next90d, 1);
        assert_eq!(label_rows(&rows, &claims, 30)[0].label_claim_next90d, 0);
    }

    #[test]
    fn test_no_claims_labels_zero() {
        let l = label_rows(&[row("P1", 2024, 1)], &[], DEFAULT_WINDOW_DAYS);
        assert_eq!(l[0].label_claim_next90d, 0);
    }

    #[test]
    fn test_oversized_window_saturates() {
        let rows = vec![row("P1", 2024, 1)];
        let claims = vec![claim("P1", 2090, 5, 1, true)];
        let l = label_rows(&rows, &claims, 100_000_000);
        assert_eq!(l[0].label_claim_next90d, 1);
        let l = label_rows(&rows, &claims, i64::MAX);
        assert_eq!(l[0].label_claim_next90d, 1);
    }
}
