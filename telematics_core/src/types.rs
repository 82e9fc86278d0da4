use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identity of one driving session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TripKey {
    pub policy_id: String,
    pub trip_id: String,
}

impl TripKey {
    pub fn new(policy_id: impl Into<String>, trip_id: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            trip_id: trip_id.into(),
        }
    }

    /// Ingest files are named `<policy_id>__<trip_id>.jsonl`.
    pub fn from_file_stem(stem: &str) -> Self {
        match stem.split_once("__") {
            Some((policy, trip)) => Self::new(policy, trip),
            None => Self::new("unknown", stem),
        }
    }

    pub fn file_stem(&self) -> String {
        format!("{}__{}", self.policy_id, self.trip_id)
    }

    /// Whether both ids can name an ingest file that stays inside its
    /// directory and splits back into this same key.
    pub fn is_valid(&self) -> bool {
        valid_id(&self.policy_id) && valid_id(&self.trip_id)
    }
}

// No path syntax, no `__`, and no `_` at either end so the separator is
// unambiguous.
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && !id.contains("__")
        && !id.starts_with('_')
        && !id.ends_with('_')
        && !id.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

/// One raw telemetry sample as delivered by the ingest boundary.
///
/// Everything but the key is optional; the reconstructor decides what a
/// missing value means for each statistic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_mps2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ax_mps2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ay_mps2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub az_mps2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "Option::is_none")]
    pub braking_flag: Option<bool>,
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "Option::is_none")]
    pub phone_usage_flag: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_speed_limit: Option<f64>,
}

// Producers write flags either as JSON booleans or as 0/1 numbers.
fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Num(f64),
    }
    Ok(Option::<Raw>::deserialize(d)?.map(|r| match r {
        Raw::Bool(b) => b,
        Raw::Num(n) => !n.is_nan() && n != 0.0,
    }))
}

/// Trip-level aggregate reconstructed from one batch of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub policy_id: String,
    pub trip_id: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub duration_s: f64,
    pub miles: f64,
    pub avg_speed_mps: f64,
    pub harsh_brake_ct: u32,
    pub phone_usage_ct: u32,
    pub overspeed_ratio: f64,
    pub night_ratio: f64,
}

impl TripSummary {
    pub fn key(&self) -> TripKey {
        TripKey::new(self.policy_id.clone(), self.trip_id.clone())
    }
}

/// One feature row per (policy, calendar month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPeriodRow {
    pub policy_id: String,
    pub period_start: NaiveDate,
    pub trip_ct: u32,
    pub exposure_miles: f64,
    pub duration_s: f64,
    pub harsh_brake_per_100mi: f64,
    pub overspeed_ratio: f64,
    pub night_ratio: f64,
    pub avg_overspeed_ratio: f64,
    pub night_miles_ratio: f64,
    pub phone_usage_per_hr: f64,
    pub mean_speed_mps: f64,
    pub miles_per_trip: f64,
    pub speed_var_across_trips: f64,
}

impl DriverPeriodRow {
    pub fn period_key(&self) -> PeriodKey {
        PeriodKey {
            policy_id: self.policy_id.clone(),
            period_start: self.period_start,
        }
    }
}

/// Grouping key of the period aggregator. Orders by policy, then month.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodKey {
    pub policy_id: String,
    pub period_start: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_key_from_stem() {
        let k = TripKey::from_file_stem("P001__T42");
        assert_eq!(k, TripKey::new("P001", "T42"));
        assert_eq!(k.file_stem(), "P001__T42");

        let k = TripKey::from_file_stem("lonely");
        assert_eq!(k.policy_id, "unknown");
        assert_eq!(k.trip_id, "lonely");
    }

    #[test]
    fn test_trip_key_validity() {
        assert!(TripKey::new("P-001", "trip.7").is_valid());
        assert!(TripKey::new("P_1", "T_2").is_valid());
        for (p, t) in [
            ("../escaped", "T1"),
            ("P1", "a/b"),
            ("P1", "a\\b"),
            ("P__X", "T1"),
            ("P_", "T1"),
            ("P1", "_T1"),
            ("", "T1"),
            ("P1", "T\n1"),
        ] {
            assert!(!TripKey::new(p, t).is_valid(), "{p:?} / {t:?}");
        }
        let k = TripKey::new("P_1", "T_2");
        assert_eq!(TripKey::from_file_stem(&k.file_stem()), k);
    }

    #[test]
    fn test_point_accepts_numeric_and_bool_flags() {
        let p: TelemetryPoint = serde_json::from_str(
            r#"{"ts":"2024-03-01T12:00:00Z","lat":1.0,"lon":2.0,"braking_flag":1,"phone_usage_flag":false}"#,
        )
        .unwrap();
        assert_eq!(p.braking_flag, Some(true));
        assert_eq!(p.phone_usage_flag, Some(false));
        assert_eq!(p.speed_mps, None);

        let p: TelemetryPoint =
            serde_json::from_str(r#"{"ts":"x","braking_flag":0,"phone_usage_flag":true,"lat":null}"#).unwrap();
        assert_eq!(p.braking_flag, Some(false));
        assert_eq!(p.phone_usage_flag, Some(true));
        assert_eq!(p.lat, None);
    }
}
