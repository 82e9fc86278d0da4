//! Monthly driver-period aggregation over trip summaries.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::trip::METERS_PER_MILE;
use crate::types::{DriverPeriodRow, PeriodKey, TripSummary};

/// Floor for mileage used as a weight or a denominator.
pub const MILES_FLOOR: f64 = 1e-6;
/// Floor for durations (seconds) used as a weight or a denominator.
pub const DURATION_FLOOR_S: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub trips_in: usize,
    pub rows_out: usize,
    pub rows_recomputed: usize,
    pub rows_removed: usize,
    pub single_trip_groups: usize,
    pub zero_exposure_groups: usize,
    pub defaulted_values: usize,
}

/// First day of the trip's month, taken from the UTC wall-clock date.
pub fn period_start(ts: &DateTime<Utc>) -> NaiveDate {
    let date = ts.date_naive();
    date.with_day(1).unwrap_or(date)
}

pub fn period_key(trip: &TripSummary) -> PeriodKey {
    PeriodKey {
        policy_id: trip.policy_id.clone(),
        period_start: period_start(&trip.start_ts),
    }
}

// Trip values after defaulting, ready for weighting.
#[derive(Debug, Clone, Copy)]
struct CleanTrip {
    miles: f64,
    duration_s: f64,
    avg_speed_mps: f64,
    harsh_brake_ct: f64,
    phone_usage_ct: f64,
    overspeed_ratio: f64,
    night_ratio: f64,
}

fn finite_or_zero(v: f64, defaulted: &mut usize) -> f64 {
    if v.is_finite() {
        v
    } else {
        *defaulted += 1;
        0.0
    }
}

fn ratio_floor(v: f64, defaulted: &mut usize) -> f64 {
    finite_or_zero(v, defaulted).max(0.0)
}

fn sanitize(t: &TripSummary, defaulted: &mut usize) -> CleanTrip {
    let miles = finite_or_zero(t.miles, defaulted).max(0.0);
    let duration_s = finite_or_zero(t.duration_s, defaulted).max(0.0);
    let avg_speed_mps = if t.avg_speed_mps.is_finite() {
        t.avg_speed_mps
    } else {
        *defaulted += 1;
        if duration_s > 0.0 {
            miles * METERS_PER_MILE / duration_s
        } else {
            0.0
        }
    };
    CleanTrip {
        miles,
        duration_s,
        avg_speed_mps,
        harsh_brake_ct: f64::from(t.harsh_brake_ct),
        phone_usage_ct: f64::from(t.phone_usage_ct),
        overspeed_ratio: ratio_floor(t.overspeed_ratio, defaulted),
        night_ratio: ratio_floor(t.night_ratio, defaulted),
    }
}

// Normalizing each weight first keeps a single-trip mean exactly equal to the
// trip's own value.
fn weighted_mean(values: impl Iterator<Item = (f64, f64)> + Clone) -> f64 {
    let total: f64 = values.clone().map(|(_, w)| w).sum();
    values.map(|(v, w)| (w / total) * v).sum()
}

/// Sample variance (n - 1). Fewer than two values report 0.0.
fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

fn build_row(key: &PeriodKey, trips: &[CleanTrip], stats: &mut AggregateStats) -> DriverPeriodRow {
    let trip_ct = trips.len();
    let exposure_miles: f64 = trips.iter().map(|t| t.miles).sum();
    let duration_s: f64 = trips.iter().map(|t| t.duration_s).sum();
    let harsh: f64 = trips.iter().map(|t| t.harsh_brake_ct).sum();
    let phone: f64 = trips.iter().map(|t| t.phone_usage_ct).sum();
    let night_miles: f64 = trips.iter().map(|t| t.night_ratio * t.miles).sum();

    if trip_ct == 1 {
        stats.single_trip_groups += 1;
    }
    if exposure_miles <= MILES_FLOOR {
        stats.zero_exposure_groups += 1;
    }

    let mean_speed_mps = weighted_mean(
        trips.iter().map(|t| (t.avg_speed_mps, t.miles.max(MILES_FLOOR))),
    );
    let avg_overspeed_ratio = weighted_mean(
        trips.iter().map(|t| (t.overspeed_ratio, t.duration_s.max(DURATION_FLOOR_S))),
    );
    let speeds: Vec<f64> = trips.iter().map(|t| t.avg_speed_mps).collect();
    let miles_denom = exposure_miles.max(MILES_FLOOR);
    let night_miles_ratio = night_miles / miles_denom;

    let d = &mut stats.defaulted_values;
    DriverPeriodRow {
        policy_id: key.policy_id.clone(),
        period_start: key.period_start,
        trip_ct: trip_ct as u32,
        exposure_miles: finite_or_zero(exposure_miles, d),
        duration_s: finite_or_zero(duration_s, d),
        harsh_brake_per_100mi: finite_or_zero(harsh / miles_denom * 100.0, d),
        overspeed_ratio: finite_or_zero(avg_overspeed_ratio, d).clamp(0.0, 1.0),
        night_ratio: finite_or_zero(night_miles_ratio, d).clamp(0.0, 1.0),
        avg_overspeed_ratio: finite_or_zero(avg_overspeed_ratio, d),
        night_miles_ratio: finite_or_zero(night_miles_ratio, d),
        phone_usage_per_hr: finite_or_zero(phone / (duration_s.max(DURATION_FLOOR_S) / 3600.0), d),
        mean_speed_mps: finite_or_zero(mean_speed_mps, d),
        miles_per_trip: finite_or_zero(exposure_miles / (trip_ct.max(1) as f64), d),
        speed_var_across_trips: finite_or_zero(sample_variance(&speeds), d),
    }
}

fn group<'a>(
    trips: impl Iterator<Item = &'a TripSummary>,
    stats: &mut AggregateStats,
) -> BTreeMap<PeriodKey, Vec<CleanTrip>> {
    let mut groups: BTreeMap<PeriodKey, Vec<CleanTrip>> = BTreeMap::new();
    for t in trips {
        stats.trips_in += 1;
        let clean = sanitize(t, &mut stats.defaulted_values);
        groups.entry(period_key(t)).or_default().push(clean);
    }
    groups
}

/// Aggregate every trip into one row per (policy, month), sorted by key.
pub fn aggregate(trips: &[TripSummary]) -> (Vec<DriverPeriodRow>, AggregateStats) {
    let mut stats = AggregateStats::default();
    let groups = group(trips.iter(), &mut stats);
    let rows: Vec<DriverPeriodRow> = groups
        .iter()
        .map(|(key, g)| build_row(key, g, &mut stats))
        .collect();
    stats.rows_out = rows.len();
    stats.rows_recomputed = rows.len();
    (rows, stats)
}

/// Re-run over a changed trip history.
///
/// `changed` holds the current summaries of new or modified trips and
/// `superseded` the earlier versions of modified or removed trips. Every
/// period either set falls in is rebuilt wholesale from `all_trips`, as is any
/// period in `all_trips` that `previous` never had. A rebuilt period with no
/// trips left is dropped. Other previous rows are carried over untouched.
pub fn refresh(
    previous: &[DriverPeriodRow],
    all_trips: &[TripSummary],
    changed: &[TripSummary],
    superseded: &[TripSummary],
) -> (Vec<DriverPeriodRow>, AggregateStats) {
    let mut out: BTreeMap<PeriodKey, DriverPeriodRow> =
        previous.iter().map(|r| (r.period_key(), r.clone())).collect();

    let mut dirty: BTreeSet<PeriodKey> = changed.iter().chain(superseded).map(period_key).collect();
    dirty.extend(
        all_trips
            .iter()
            .map(period_key)
            .filter(|k| !out.contains_key(k)),
    );

    let mut stats = AggregateStats::default();
    let groups = group(
        all_trips.iter().filter(|t| dirty.contains(&period_key(t))),
        &mut stats,
    );
    for key in &dirty {
        match groups.get(key) {
            Some(g) => {
                let row = build_row(key, g, &mut stats);
                out.insert(key.clone(), row);
                stats.rows_recomputed += 1;
            }
            None => {
                if out.remove(key).is_some() {
                    stats.rows_removed += 1;
                }
            }
        }
    }
    stats.rows_out = out.len();
    (out.into_values().collect(), stats)
}

/// Most recent period row of one policy.
pub fn latest_for_policy<'a>(rows: &'a [DriverPeriodRow], policy_id: &str) -> Option<&'a DriverPeriodRow> {
    rows.iter()
        .filter(|r| r.policy_id == policy_id)
        .max_by_key(|r| r.period_start)
}

/// Most recent period row of every policy, ordered by policy.
pub fn latest_per_policy(rows: &[DriverPeriodRow]) -> Vec<&DriverPeriodRow> {
    let mut latest: BTreeMap<&str, &DriverPeriodRow> = BTreeMap::new();
    for r in rows {
        latest
            .entry(r.policy_id.as_str())
            .and_modify(|cur| {
                if r.period_start > cur.period_start {
                    *cur = r;
                }
            })
            .or_insert(r);
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_latest_row_selection() {
        let trips = vec![
            trip("P1", "a", at(2024, 3, 3, 1), 1.0, 60.0, 1.0),
            trip("P1", "b", at(2024, 1, 3, 1), 2.0, 60.0, 1.0),
            trip("P2", "c", at(2023, 12, 3, 1), 3.0, 60.0, 1.0),
        ];
        let (rows, _) = aggregate(&trips);
        let latest = latest_per_policy(&rows);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].period_start.month(), 3);
        assert_eq!(latest[1].policy_id, "P2");
        assert_eq!(
            latest_for_policy(&rows, "P1").map(|r| r.period_start.month()),
            Some(3)
        );
        assert!(latest_for_policy(&rows, "P9").is_none());
    }

    fn trip(policy: &str, id: &str, start: DateTime<Utc>, miles: f64, dur: f64, speed: f64) -> TripSummary {
        TripSummary {
            policy_id: policy.into(),
            trip_id: id.into(),
            start_ts: start,
            end_ts: start + chrono::Duration::seconds(dur as i64),
            duration_s: dur,
            miles,
            avg_speed_mps: speed,
            harsh_brake_ct: 0,
            phone_usage_ct: 0,
            overspeed_ratio: 0.0,
            night_ratio: 0.0,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_period_start_is_first_of_month() {
        assert_eq!(period_start(&at(2024, 2, 29, 23)), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(period_start(&at(2024, 3, 1, 0)), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_single_trip_group() {
        let (rows, stats) = aggregate(&[trip("P1", "T1", at(2024, 3, 5, 12), 3.7, 600.0, 11.3)]);
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.trip_ct, 1);
        assert_eq!(r.mean_speed_mps, 11.3, "weighted mean of one trip is that trip's speed");
        assert_eq!(r.speed_var_across_trips, 0.0, "single-trip variance reports 0.0");
        assert_eq!(r.miles_per_trip, 3.7);
        assert_eq!(stats.single_trip_groups, 1);
    }

    #[test]
    fn test_weighted_means_and_rates() {
        let mut a = trip("P1", "T1", at(2024, 3, 5, 12), 10.0, 1800.0, 10.0);
        a.harsh_brake_ct = 3;
        a.phone_usage_ct = 2;
        a.overspeed_ratio = 0.5;
        a.night_ratio = 1.0;
        let mut b = trip("P1", "T2", at(2024, 3, 20, 8), 30.0, 1800.0, 20.0);
        b.harsh_brake_ct = 1;
        b.overspeed_ratio = 0.1;
        let (rows, _) = aggregate(&[a, b]);
        let r = &rows[0];
        assert_eq!(r.trip_ct, 2);
        assert!((r.exposure_miles - 40.0).abs() < 1e-12);
        assert!((r.mean_speed_mps - 17.5).abs() < 1e-12);
        assert!((r.avg_overspeed_ratio - 0.3).abs() < 1e-12);
        assert!((r.harsh_brake_per_100mi - 10.0).abs() < 1e-12);
        assert!((r.night_miles_ratio - 0.25).abs() < 1e-12);
        assert!((r.phone_usage_per_hr - 2.0).abs() < 1e-12);
        assert!((r.speed_var_across_trips - 50.0).abs() < 1e-12);
        assert!((r.miles_per_trip - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_exposure_stays_finite() {
        let mut t = trip("P1", "T1", at(2024, 3, 5, 12), 0.0, 0.0, 0.0);
        t.harsh_brake_ct = 2;
        t.phone_usage_ct = 1;
        let (rows, stats) = aggregate(&[t]);
        let r = &rows[0];
        assert!(r.harsh_brake_per_100mi.is_finite());
        assert!((r.harsh_brake_per_100mi - 2e8).abs() < 1.0);
        assert!((r.phone_usage_per_hr - 3600.0).abs() < 1e-6);
        assert_eq!(stats.zero_exposure_groups, 1);
    }

    #[test]
    fn test_nan_inputs_are_defaulted() {
        let mut t = trip("P1", "T1", at(2024, 3, 5, 12), 1.0, 1609.34, f64::NAN);
        t.overspeed_ratio = f64::NAN;
        t.night_ratio = -0.2;
        let (rows, stats) = aggregate(&[t]);
        let r = &rows[0];
        assert!((r.mean_speed_mps - 1.0).abs() < 1e-12, "speed falls back to distance / time");
        assert_eq!(r.overspeed_ratio, 0.0);
        assert_eq!(r.night_ratio, 0.0);
        assert_eq!(stats.defaulted_values, 2);
    }

    #[test]
    fn test_ratios_clipped_to_unit_interval() {
        let mut t = trip("P1", "T1", at(2024, 3, 5, 12), 1.0, 60.0, 5.0);
        t.overspeed_ratio = 1.4;
        let (rows, _) = aggregate(&[t]);
        assert_eq!(rows[0].overspeed_ratio, 1.0);
        assert!((rows[0].avg_overspeed_ratio - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_rows_sorted_by_policy_then_period() {
        let trips = vec![
            trip("P2", "a", at(2024, 1, 3, 1), 1.0, 60.0, 1.0),
            trip("P1", "b", at(2024, 2, 3, 1), 1.0, 60.0, 1.0),
            trip("P1", "c", at(2024, 1, 31, 23), 1.0, 60.0, 1.0),
        ];
        let (rows, _) = aggregate(&trips);
        let keys: Vec<(String, u32)> = rows.iter().map(|r| (r.policy_id.clone(), r.period_start.month())).collect();
        assert_eq!(
            keys,
            vec![("P1".into(), 1), ("P1".into(), 2), ("P2".into(), 1)]
        );
    }

    #[test]
    fn test_refresh_recomputes_only_touched_periods() {
        let jan = trip("P1", "j", at(2024, 1, 10, 9), 5.0, 600.0, 8.0);
        let feb = trip("P1", "f", at(2024, 2, 10, 9), 5.0, 600.0, 8.0);
        let (mut previous, _) = aggregate(&[jan.clone(), feb.clone()]);
        // mark the january row so we can tell whether it was rewritten
        previous[0].exposure_miles = 999.0;

        let feb2 = trip("P1", "f2", at(2024, 2, 11, 9), 15.0, 600.0, 12.0);
        let all = vec![jan, feb, feb2.clone()];
        let (rows, stats) = refresh(&previous, &all, &[feb2], &[]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].exposure_miles, 999.0, "untouched period is carried over");
        assert_eq!(rows[1].trip_ct, 2);
        assert!((rows[1].exposure_miles - 20.0).abs() < 1e-12);
        assert_eq!(stats.rows_recomputed, 1);
    }

    #[test]
    fn test_refresh_rebuilds_period_a_trip_left() {
        let before = trip("P1", "t", at(2024, 2, 1, 0), 5.0, 600.0, 8.0);
        let other = trip("P1", "o", at(2024, 3, 2, 9), 2.0, 600.0, 8.0);
        let (previous, _) = aggregate(&[before.clone(), other.clone()]);

        let mut after = before.clone();
        after.start_ts = at(2024, 1, 31, 23);
        let all = vec![after.clone(), other];
        let (rows, stats) = refresh(&previous, &all, &[after], &[before]);
        let (full, _) = aggregate(&all);
        assert_eq!(rows, full);
        assert_eq!(rows[0].period_start.month(), 1);
        assert_eq!(stats.rows_removed, 1, "february has no trips left");
    }

    #[test]
    fn test_refresh_drops_vanished_trip() {
        let jan = trip("P1", "j", at(2024, 1, 10, 9), 5.0, 600.0, 8.0);
        let jan2 = trip("P1", "k", at(2024, 1, 12, 9), 7.0, 600.0, 9.0);
        let (previous, _) = aggregate(&[jan.clone(), jan2.clone()]);
        let (rows, stats) = refresh(&previous, &[jan.clone()], &[], &[jan2]);
        assert_eq!(rows, aggregate(&[jan]).0);
        assert_eq!(rows[0].trip_ct, 1);
        assert_eq!(stats.rows_recomputed, 1);
        assert_eq!(stats.rows_removed, 0);
    }

    #[test]
    fn test_reaggregation_is_idempotent() {
        let trips = vec![
            trip("P1", "a", at(2024, 1, 3, 1), 1.5, 60.0, 4.0),
            trip("P1", "b", at(2024, 1, 4, 1), 2.5, 90.0, 6.0),
        ];
        let (first, _) = aggregate(&trips);
        let (second, _) = aggregate(&trips);
        assert_eq!(first, second);
    }
}
