use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::ConfigError;
use crate::labels::{DEFAULT_WINDOW_DAYS, MAX_WINDOW_DAYS};
use crate::pricing::{Calibration, CalibrationSpec};

/// File locations, service binding and pricing calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_ingest: PathBuf,
    pub trips_csv: PathBuf,
    pub driver_period_csv: PathBuf,
    pub claims_csv: PathBuf,
    pub labeled_csv: PathBuf,
    pub pricing_csv: PathBuf,
    pub model_path: PathBuf,
    pub bind_addr: String,
    pub label_window_days: i64,
    pub calibration: CalibrationSpec,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_ingest: PathBuf::from("data_ingest"),
            trips_csv: PathBuf::from("data/trips.csv"),
            driver_period_csv: PathBuf::from("data/driver_period.csv"),
            claims_csv: PathBuf::from("data/claims.csv"),
            labeled_csv: PathBuf::from("data/driver_period_labeled.csv"),
            pricing_csv: PathBuf::from("data/pricing_preview.csv"),
            model_path: PathBuf::from("models/behavior_model.json"),
            bind_addr: "0.0.0.0:8000".to_string(),
            label_window_days: DEFAULT_WINDOW_DAYS,
            calibration: CalibrationSpec::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::BadEnv { var, value }),
        None => Ok(None),
    }
}

impl Settings {
    /// Defaults, then `.env`, then process environment. Invalid calibration
    /// fails here rather than at the first price.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_overrides(|k| env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// JSON settings file; absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let data = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let cfg: Settings = serde_json::from_str(&data).map_err(|e| file_err(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from any key/value source (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let paths: [(&str, &mut PathBuf); 7] = [
            ("DATA_INGEST_DIR", &mut self.data_ingest),
            ("TRIPS_CSV", &mut self.trips_csv),
            ("DRIVER_PERIOD_CSV", &mut self.driver_period_csv),
            ("CLAIMS_CSV", &mut self.claims_csv),
            ("LABELED_CSV", &mut self.labeled_csv),
            ("PRICING_CSV", &mut self.pricing_csv),
            ("MODEL_PATH", &mut self.model_path),
        ];
        for (var, slot) in paths {
            if let Some(v) = lookup(var) {
                *slot = PathBuf::from(v);
            }
        }

        if let Some(v) = lookup("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(port) = parse_var::<u16>("PORT", &lookup)? {
            let host = self
                .bind_addr
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.bind_addr = format!("{host}:{port}");
        }
        if let Some(days) = parse_var::<i64>("LABEL_WINDOW_DAYS", &lookup)? {
            self.label_window_days = days;
            self.check_label_window()?;
        }

        let c = &mut self.calibration;
        if let Some(v) = parse_var("BASELINE_PREV", &lookup)? {
            c.baseline = v;
        }
        if let Some(v) = parse_var("PRICING_SLOPE", &lookup)? {
            c.slope = v;
        }
        if let Some(v) = parse_var("FACTOR_MIN", &lookup)? {
            c.factor_min = v;
        }
        if let Some(v) = parse_var("FACTOR_MAX", &lookup)? {
            c.factor_max = v;
        }
        Ok(())
    }

    pub fn calibration(&self) -> Result<Calibration, ConfigError> {
        Calibration::try_from(self.calibration)
    }

    fn check_label_window(&self) -> Result<(), ConfigError> {
        if (1..=MAX_WINDOW_DAYS).contains(&self.label_window_days) {
            Ok(())
        } else {
            Err(ConfigError::LabelWindow {
                days: self.label_window_days,
                max: MAX_WINDOW_DAYS,
            })
        }
    }

    /// Every check that must pass before a stage or the service starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_label_window()?;
        self.calibration().map(|_| ())
    }
}
