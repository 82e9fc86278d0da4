//! Telemetry-to-price pipeline: raw points become trip summaries, trips
//! become monthly driver-period feature rows, and an estimator's risk
//! probability becomes a bounded pricing factor.
//!
//! Every stage here is a pure transform over a complete in-memory collection.
//! File access lives in [`store`] and is driven by the binaries.

pub mod config;
pub mod error;
pub mod estimator;
pub mod features;
pub mod labels;
pub mod period;
pub mod pricing;
pub mod store;
pub mod trip;
pub mod types;

pub use config::Settings;
pub use error::{ConfigError, Error, EstimatorError, PricingError, Result, StoreError};
pub use estimator::{Capability, RiskEstimator, ScoringContext};
pub use features::{FeatureContract, FeatureName, FeatureVector};
pub use pricing::{Calibration, PricingResult};
pub use types::{DriverPeriodRow, PeriodKey, TelemetryPoint, TripKey, TripSummary};
