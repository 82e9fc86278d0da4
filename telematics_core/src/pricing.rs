//! Risk probability to bounded pricing factor.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PricingError};
use crate::features::FeatureVector;

/// Calibration constants of the affine pricing rule. Only [`Calibration::new`]
/// builds one, so an instance is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    baseline: f64,
    slope: f64,
    factor_min: f64,
    factor_max: f64,
}

/// Unvalidated calibration as it appears in settings files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSpec {
    pub baseline: f64,
    pub slope: f64,
    pub factor_min: f64,
    pub factor_max: f64,
}

impl Default for CalibrationSpec {
    fn default() -> Self {
        Self {
            baseline: 0.30,
            slope: 0.5,
            factor_min: 0.90,
            factor_max: 1.10,
        }
    }
}

impl TryFrom<CalibrationSpec> for Calibration {
    type Error = ConfigError;

    fn try_from(s: CalibrationSpec) -> Result<Self, Self::Error> {
        Calibration::new(s.baseline, s.slope, s.factor_min, s.factor_max)
    }
}

/// Factor before and after clipping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub raw: f64,
    pub factor: f64,
}

impl Calibration {
    pub fn new(baseline: f64, slope: f64, factor_min: f64, factor_max: f64) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("baseline", baseline),
            ("slope", slope),
            ("factor_min", factor_min),
            ("factor_max", factor_max),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { name, value });
            }
        }
        if !(factor_min <= 1.0 && 1.0 <= factor_max) {
            return Err(ConfigError::BoundsOrder {
                min: factor_min,
                max: factor_max,
            });
        }
        Ok(Self {
            baseline,
            slope,
            factor_min,
            factor_max,
        })
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    pub fn bounds(&self) -> [f64; 2] {
        [self.factor_min, self.factor_max]
    }

    pub fn spec(&self) -> CalibrationSpec {
        CalibrationSpec {
            baseline: self.baseline,
            slope: self.slope,
            factor_min: self.factor_min,
            factor_max: self.factor_max,
        }
    }

    /// `clamp(1 + slope * (p - baseline), min, max)`.
    ///
    /// `p` slightly outside [0, 1] is accepted as is; the clip bounds the result.
    pub fn quote(&self, p: f64) -> Result<Quote, PricingError> {
        if !p.is_finite() {
            return Err(PricingError::NonFiniteProbability(p));
        }
        let raw = 1.0 + self.slope * (p - self.baseline);
        Ok(Quote {
            raw,
            factor: raw.clamp(self.factor_min, self.factor_max),
        })
    }

    pub fn factor(&self, p: f64) -> Result<f64, PricingError> {
        self.quote(p).map(|q| q.factor)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        let s = CalibrationSpec::default();
        Self {
            baseline: s.baseline,
            slope: s.slope,
            factor_min: s.factor_min,
            factor_max: s.factor_max,
        }
    }
}

/// Pricing answer for one policy. Derived on request, never stored as truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingResult {
    pub policy_id: String,
    pub period_start: NaiveDate,
    pub risk_p: f64,
    pub telematics_factor: f64,
    pub raw_factor: f64,
    pub features: FeatureVector,
    pub baseline: f64,
    pub slope_k: f64,
    pub cap: [f64; 2],
}

impl PricingResult {
    pub fn new(
        policy_id: impl Into<String>,
        period_start: NaiveDate,
        risk_p: f64,
        features: FeatureVector,
        calibration: &Calibration,
    ) -> Result<Self, PricingError> {
        let q = calibration.quote(risk_p)?;
        Ok(Self {
            policy_id: policy_id.into(),
            period_start,
            risk_p,
            telematics_factor: q.factor,
            raw_factor: q.raw,
            features,
            baseline: calibration.baseline(),
            slope_k: calibration.slope(),
            cap: calibration.bounds(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> Calibration {
        Calibration::new(0.30, 0.5, 0.90, 1.10).unwrap()
    }

    #[test]
    fn test_baseline_prices_at_parity() {
        assert_eq!(cal().factor(0.30).unwrap(), 1.0);
    }

    #[test]
    fn test_extremes_saturate() {
        let c = Calibration::new(0.30, 2.0, 0.5, 1.5).unwrap();
        assert_eq!(c.factor(0.0).unwrap(), 0.5);
        assert_eq!(c.factor(1.0).unwrap(), 1.5);
        let q = c.quote(1.0).unwrap();
        assert!((q.raw - 2.4).abs() < 1e-12, "raw value is reported before the clip");
    }

    #[test]
    fn test_probability_outside_unit_interval_is_tolerated() {
        assert_eq!(cal().factor(1.0000001).unwrap(), 1.10);
        assert_eq!(cal().factor(-1e-9).unwrap(), 0.90);
    }

    #[test]
    fn test_non_finite_probability_rejected() {
        assert!(matches!(
            cal().factor(f64::NAN),
            Err(PricingError::NonFiniteProbability(_))
        ));
        assert!(cal().quote(f64::INFINITY).is_err());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        assert!(matches!(
            Calibration::new(0.3, 0.5, 1.05, 1.10),
            Err(ConfigError::BoundsOrder { .. })
        ));
        assert!(matches!(
            Calibration::new(0.3, 0.5, 0.9, 0.95),
            Err(ConfigError::BoundsOrder { .. })
        ));
        assert!(matches!(
            Calibration::new(0.3, f64::INFINITY, 0.9, 1.1),
            Err(ConfigError::NonFinite { name: "slope", .. })
        ));
        assert!(Calibration::new(0.3, 0.5, 1.0, 1.0).is_ok());
    }

    #[test]
    fn test_spec_round_trip() {
        let spec = CalibrationSpec::default();
        let c = Calibration::try_from(spec).unwrap();
        assert_eq!(c, Calibration::default());
        assert_eq!(c.spec(), spec);
    }
}
