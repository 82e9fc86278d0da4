use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use telematics_core::pricing::CalibrationSpec;
use telematics_core::{TelemetryPoint, TripKey};

/// One sample as posted by devices. Coordinates and time are required here;
/// everything else may be omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct PointIn {
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub speed_mps: Option<f64>,
    pub ax_mps2: Option<f64>,
    pub ay_mps2: Option<f64>,
    pub az_mps2: Option<f64>,
    pub heading: Option<f64>,
    pub braking_flag: Option<bool>,
    pub phone_usage_flag: Option<bool>,
    pub road_speed_limit: Option<f64>,
}

impl From<PointIn> for TelemetryPoint {
    fn from(p: PointIn) -> Self {
        TelemetryPoint {
            ts: Some(p.ts.to_rfc3339()),
            lat: Some(p.lat),
            lon: Some(p.lon),
            speed_mps: p.speed_mps,
            ax_mps2: p.ax_mps2,
            ay_mps2: p.ay_mps2,
            az_mps2: p.az_mps2,
            heading: p.heading,
            braking_flag: p.braking_flag,
            phone_usage_flag: p.phone_usage_flag,
            road_speed_limit: p.road_speed_limit,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryBatch {
    pub policy_id: String,
    pub trip_id: String,
    pub points: Vec<PointIn>,
}

impl TelemetryBatch {
    pub fn key(&self) -> TripKey {
        TripKey::new(self.policy_id.clone(), self.trip_id.clone())
    }
}

// Ingest accepts a single batch or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestPayload {
    One(TelemetryBatch),
    Many(Vec<TelemetryBatch>),
}

impl IngestPayload {
    pub fn into_batches(self) -> Vec<TelemetryBatch> {
        match self {
            IngestPayload::One(b) => vec![b],
            IngestPayload::Many(v) => v,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestOut {
    pub status: &'static str,
    pub received: usize,
    pub file: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub model_loaded: bool,
    pub features: Option<Vec<String>>,
    pub unknown_features: usize,
    pub calibration: CalibrationSpec,
}

#[derive(Debug, Serialize)]
pub struct ScoreOut {
    pub risk_p: f64,
    pub features: telematics_core::FeatureVector,
}
