//! Opaque risk estimators and the immutable scoring context built around them.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EstimatorError;
use crate::features::{FeatureContract, FeatureVector};
use crate::pricing::{Calibration, PricingResult};
use crate::types::DriverPeriodRow;

/// What an estimator's raw output means. Chosen once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Already a calibrated probability.
    Probability,
    /// Unbounded decision score, squashed with the logistic function.
    Margin,
    /// Hard class label.
    Label,
}

impl Capability {
    pub fn to_probability(self, raw: f64) -> f64 {
        match self {
            Capability::Probability => raw,
            Capability::Margin => sigmoid(raw),
            Capability::Label => {
                if raw > 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

pub trait RiskEstimator: Send + Sync + fmt::Debug {
    fn capability(&self) -> Capability;

    /// Expected input width, when the estimator has a fixed one.
    fn input_dim(&self) -> Option<usize>;

    fn raw(&self, x: &[f64]) -> Result<f64, EstimatorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Standardize-then-logistic-regression model.
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticModel {
    coefficients: Vec<f64>,
    intercept: f64,
    scaler: Option<Scaler>,
    output: Capability,
}

impl LogisticModel {
    pub fn new(
        coefficients: Vec<f64>,
        intercept: f64,
        scaler: Option<Scaler>,
        output: Capability,
    ) -> Result<Self, EstimatorError> {
        if let Some(s) = &scaler {
            for got in [s.mean.len(), s.scale.len()] {
                if got != coefficients.len() {
                    return Err(EstimatorError::Scaler {
                        got,
                        expected: coefficients.len(),
                    });
                }
            }
        }
        Ok(Self {
            coefficients,
            intercept,
            scaler,
            output,
        })
    }

    fn margin(&self, x: &[f64]) -> f64 {
        let z = x.iter().zip(&self.coefficients).enumerate().map(|(i, (v, w))| {
            let v = match &self.scaler {
                Some(s) => {
                    // zero-variance columns were left unscaled at fit time
                    let scale = if s.scale[i] == 0.0 { 1.0 } else { s.scale[i] };
                    (v - s.mean[i]) / scale
                }
                None => *v,
            };
            v * w
        });
        self.intercept + z.sum::<f64>()
    }
}

impl RiskEstimator for LogisticModel {
    fn capability(&self) -> Capability {
        self.output
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.coefficients.len())
    }

    fn raw(&self, x: &[f64]) -> Result<f64, EstimatorError> {
        if x.len() != self.coefficients.len() {
            return Err(EstimatorError::Input {
                got: x.len(),
                expected: self.coefficients.len(),
            });
        }
        let m = self.margin(x);
        Ok(match self.output {
            Capability::Probability => sigmoid(m),
            Capability::Margin => m,
            Capability::Label => {
                if m > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        })
    }
}

/// Fixed output regardless of input. What the trainer ships when the training
/// labels were single-class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantModel {
    pub value: f64,
    pub output: Capability,
}

impl RiskEstimator for ConstantModel {
    fn capability(&self) -> Capability {
        self.output
    }

    fn input_dim(&self) -> Option<usize> {
        None
    }

    fn raw(&self, _x: &[f64]) -> Result<f64, EstimatorError> {
        Ok(self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Logistic {
        coefficients: Vec<f64>,
        intercept: f64,
        #[serde(default)]
        scaler: Option<Scaler>,
    },
    Constant {
        p: f64,
    },
}

/// On-disk model artifact (JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
    #[serde(default = "default_output")]
    pub output: Capability,
    pub model: ModelSpec,
}

fn default_output() -> Capability {
    Capability::Probability
}

/// Estimator plus the feature contract it was trained on. Built once, never
/// mutated, shared by reference into every scoring call.
#[derive(Debug)]
pub struct ScoringContext {
    estimator: Box<dyn RiskEstimator>,
    contract: FeatureContract,
}

impl ScoringContext {
    pub fn new(estimator: Box<dyn RiskEstimator>, contract: FeatureContract) -> Result<Self, EstimatorError> {
        if contract.is_empty() {
            return Err(EstimatorError::EmptyContract);
        }
        if let Some(dim) = estimator.input_dim() {
            if dim != contract.len() {
                return Err(EstimatorError::Dimension {
                    features: contract.len(),
                    coefficients: dim,
                });
            }
        }
        let ctx = Self { estimator, contract };
        // warm-up on the zero vector
        ctx.probability_of(&vec![0.0; ctx.contract.len()])?;
        Ok(ctx)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, EstimatorError> {
        let contract = match &artifact.feature_names {
            Some(names) => FeatureContract::from_names(names),
            None => FeatureContract::default(),
        };
        let estimator: Box<dyn RiskEstimator> = match artifact.model {
            ModelSpec::Logistic {
                coefficients,
                intercept,
                scaler,
            } => Box::new(LogisticModel::new(coefficients, intercept, scaler, artifact.output)?),
            ModelSpec::Constant { p } => Box::new(ConstantModel {
                value: p,
                output: artifact.output,
            }),
        };
        Self::new(estimator, contract)
    }

    pub fn from_json(json: &str) -> Result<Self, EstimatorError> {
        Self::from_artifact(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EstimatorError> {
        let path = path.as_ref();
        let txt = std::fs::read_to_string(path).map_err(|source| EstimatorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&txt)
    }

    pub fn contract(&self) -> &FeatureContract {
        &self.contract
    }

    pub fn capability(&self) -> Capability {
        self.estimator.capability()
    }

    fn probability_of(&self, x: &[f64]) -> Result<f64, EstimatorError> {
        let raw = self.estimator.raw(x)?;
        let p = self.estimator.capability().to_probability(raw);
        if p.is_finite() {
            Ok(p)
        } else {
            Err(EstimatorError::NonFinite(p))
        }
    }

    /// Risk probability for a vector already laid out in contract order.
    pub fn probability(&self, v: &FeatureVector) -> Result<f64, EstimatorError> {
        self.probability_of(&v.values())
    }

    pub fn score_row(&self, row: &DriverPeriodRow) -> Result<(f64, FeatureVector), EstimatorError> {
        let v = self.contract.vector(row);
        let p = self.probability(&v)?;
        Ok((p, v))
    }

    pub fn price_row(&self, row: &DriverPeriodRow, calibration: &Calibration) -> crate::Result<PricingResult> {
        let (p, features) = self.score_row(row)?;
        Ok(PricingResult::new(
            row.policy_id.clone(),
            row.period_start,
            p,
            features,
            calibration,
        )?)
    }
}
