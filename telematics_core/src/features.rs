//! Named feature contract shared by the aggregator and the estimator.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::types::DriverPeriodRow;

/// Every numeric column a driver-period row can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureName {
    TripCt,
    ExposureMiles,
    DurationS,
    HarshBrakePer100mi,
    OverspeedRatio,
    NightRatio,
    AvgOverspeedRatio,
    NightMilesRatio,
    PhoneUsagePerHr,
    MeanSpeedMps,
    MilesPerTrip,
    SpeedVarAcrossTrips,
}

impl FeatureName {
    /// Row column order.
    pub const ALL: [FeatureName; 12] = [
        FeatureName::TripCt,
        FeatureName::ExposureMiles,
        FeatureName::DurationS,
        FeatureName::HarshBrakePer100mi,
        FeatureName::OverspeedRatio,
        FeatureName::NightRatio,
        FeatureName::AvgOverspeedRatio,
        FeatureName::NightMilesRatio,
        FeatureName::PhoneUsagePerHr,
        FeatureName::MeanSpeedMps,
        FeatureName::MilesPerTrip,
        FeatureName::SpeedVarAcrossTrips,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureName::TripCt => "trip_ct",
            FeatureName::ExposureMiles => "exposure_miles",
            FeatureName::DurationS => "duration_s",
            FeatureName::HarshBrakePer100mi => "harsh_brake_per_100mi",
            FeatureName::OverspeedRatio => "overspeed_ratio",
            FeatureName::NightRatio => "night_ratio",
            FeatureName::AvgOverspeedRatio => "avg_overspeed_ratio",
            FeatureName::NightMilesRatio => "night_miles_ratio",
            FeatureName::PhoneUsagePerHr => "phone_usage_per_hr",
            FeatureName::MeanSpeedMps => "mean_speed_mps",
            FeatureName::MilesPerTrip => "miles_per_trip",
            FeatureName::SpeedVarAcrossTrips => "speed_var_across_trips",
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureName::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or(())
    }
}

impl DriverPeriodRow {
    pub fn feature(&self, name: FeatureName) -> f64 {
        let v = match name {
            FeatureName::TripCt => f64::from(self.trip_ct),
            FeatureName::ExposureMiles => self.exposure_miles,
            FeatureName::DurationS => self.duration_s,
            FeatureName::HarshBrakePer100mi => self.harsh_brake_per_100mi,
            FeatureName::OverspeedRatio => self.overspeed_ratio,
            FeatureName::NightRatio => self.night_ratio,
            FeatureName::AvgOverspeedRatio => self.avg_overspeed_ratio,
            FeatureName::NightMilesRatio => self.night_miles_ratio,
            FeatureName::PhoneUsagePerHr => self.phone_usage_per_hr,
            FeatureName::MeanSpeedMps => self.mean_speed_mps,
            FeatureName::MilesPerTrip => self.miles_per_trip,
            FeatureName::SpeedVarAcrossTrips => self.speed_var_across_trips,
        };
        if v.is_finite() {
            v
        } else {
            0.0
        }
    }
}

/// The ten engineered features the behaviour model is trained on. Used when a
/// model artifact does not declare its own order.
pub const CANONICAL_FEATURES: [FeatureName; 10] = [
    FeatureName::ExposureMiles,
    FeatureName::TripCt,
    FeatureName::HarshBrakePer100mi,
    FeatureName::DurationS,
    FeatureName::AvgOverspeedRatio,
    FeatureName::NightMilesRatio,
    FeatureName::PhoneUsagePerHr,
    FeatureName::MeanSpeedMps,
    FeatureName::MilesPerTrip,
    FeatureName::SpeedVarAcrossTrips,
];

/// One slot of a contract. Names no row can produce always resolve to 0.0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Known(FeatureName),
    Unknown(String),
}

impl Slot {
    pub fn name(&self) -> &str {
        match self {
            Slot::Known(f) => f.as_str(),
            Slot::Unknown(s) => s,
        }
    }
}

/// Ordered feature list declared by an estimator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureContract {
    slots: Vec<Slot>,
}

impl Default for FeatureContract {
    fn default() -> Self {
        Self::from_features(&CANONICAL_FEATURES)
    }
}

impl FeatureContract {
    pub fn from_features(features: &[FeatureName]) -> Self {
        Self {
            slots: features.iter().copied().map(Slot::Known).collect(),
        }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let slots = names
            .iter()
            .map(|n| {
                let n = n.as_ref();
                n.parse::<FeatureName>()
                    .map(Slot::Known)
                    .unwrap_or_else(|_| Slot::Unknown(n.to_string()))
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name().to_string()).collect()
    }

    /// Names the aggregator can never produce: schema drift between trainer and producer.
    pub fn unknown_names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Unknown(n) => Some(n.as_str()),
                Slot::Known(_) => None,
            })
            .collect()
    }

    /// Project a row onto this contract, in contract order.
    pub fn vector(&self, row: &DriverPeriodRow) -> FeatureVector {
        let entries = self
            .slots
            .iter()
            .map(|s| {
                let v = match s {
                    Slot::Known(f) => row.feature(*f),
                    Slot::Unknown(_) => 0.0,
                };
                (s.name().to_string(), v)
            })
            .collect();
        FeatureVector { entries }
    }

    /// Order a loose name → value map. Missing or non-finite values become
    /// 0.0 and extra keys are ignored.
    pub fn vector_from_map(&self, map: &HashMap<String, f64>) -> FeatureVector {
        let entries = self
            .slots
            .iter()
            .map(|s| {
                let v = map.get(s.name()).copied().filter(|v| v.is_finite()).unwrap_or(0.0);
                (s.name().to_string(), v)
            })
            .collect();
        FeatureVector { entries }
    }
}

/// Named values in contract order. Serializes as a JSON object that keeps
/// that order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureVector {
    entries: Vec<(String, f64)>,
}

impl FeatureVector {
    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, v)| *v).collect()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
