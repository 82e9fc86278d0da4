use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("estimator error: {0}")]
    Estimator(#[from] EstimatorError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Invalid settings or calibration constants. Always fatal before pricing starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("calibration constant `{name}` is not finite ({value})")]
    NonFinite { name: &'static str, value: f64 },

    #[error("factor bounds must satisfy min <= 1 <= max, got [{min}, {max}]")]
    BoundsOrder { min: f64, max: f64 },

    #[error("environment variable {var}={value:?} is not a valid number")]
    BadEnv { var: &'static str, value: String },

    #[error("label window must be 1..={max} days, got {days}")]
    LabelWindow { days: i64, max: i64 },

    #[error("settings file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("risk probability is not finite ({0})")]
    NonFiniteProbability(f64),
}

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("failed to read model artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("model declares {features} features but carries {coefficients} coefficients")]
    Dimension { features: usize, coefficients: usize },

    #[error("scaler has {got} entries, expected {expected}")]
    Scaler { got: usize, expected: usize },

    #[error("feature vector length mismatch: got {got}, expected {expected}")]
    Input { got: usize, expected: usize },

    #[error("model artifact declares an empty feature list")]
    EmptyContract,

    #[error("estimator produced a non-finite output ({0})")]
    NonFinite(f64),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid trip key {policy_id:?} / {trip_id:?}")]
    InvalidKey { policy_id: String, trip_id: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StoreError::Csv { path: path.into(), source }
    }
}
