//! Statistical detector
//!
//! Fixed, auditable thresholds over the feature vector. Needs no training and
//! no artifact, so it always runs and acts as the fallback baseline.

use serde::{Deserialize, Serialize};

use super::ensemble::calibration::ScoreCalibrator;
use crate::config::{check_positive, check_range};
use crate::error::{ConfigError, Result};
use crate::ml::features::FeatureVector;
use crate::ml::{Detector, DetectorId, DetectorScore, NormalizedScore, ScoringInput};

/// Thresholds for the statistical detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalConfig {
    /// |volume z| at which the volume term reaches 1
    pub volume_z_threshold: f64,
    /// Volatility ratio above which the excess term starts
    pub volatility_ratio_threshold: f64,
    /// Correlation below which the decoupling term fires
    pub correlation_threshold: f64,
    /// Volume z-score needed before low correlation counts
    pub correlation_min_volume_z: f64,
    /// Upper RSI band edge; the lower edge mirrors it around 50
    pub rsi_upper: f64,
    /// Native score mapping to normalized 0
    pub normalization_floor: f64,
    /// Native score mapping to normalized 1
    pub normalization_ceiling: f64,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            volume_z_threshold: 3.0,
            volatility_ratio_threshold: 1.5,
            correlation_threshold: 0.3,
            correlation_min_volume_z: 1.0,
            rsi_upper: 70.0,
            normalization_floor: 0.5,
            normalization_ceiling: 1.0,
        }
    }
}

impl StatisticalConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_positive("volume_z_threshold", self.volume_z_threshold)?;
        check_positive("volatility_ratio_threshold", self.volatility_ratio_threshold)?;
        check_range("correlation_threshold", self.correlation_threshold, -1.0, 1.0)?;
        check_range("correlation_min_volume_z", self.correlation_min_volume_z, 0.0, f64::MAX)?;
        check_range("rsi_upper", self.rsi_upper, 50.0, 99.999)?;
        check_range("normalization_floor", self.normalization_floor, 0.0, f64::MAX)?;
        if self.normalization_ceiling <= self.normalization_floor {
            return Err(ConfigError::InvalidParameter {
                name: "normalization_ceiling",
                reason: "must exceed normalization_floor".to_string(),
            });
        }
        Ok(())
    }
}

/// Each term of the statistical score, kept for explanations
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatisticalBreakdown {
    pub volume: f64,
    pub volatility: f64,
    pub decoupling: f64,
    pub rsi: f64,
}

impl StatisticalBreakdown {
    /// The native score: the largest term
    pub fn max_term(&self) -> f64 {
        self.volume.max(self.volatility).max(self.decoupling).max(self.rsi)
    }

    /// Name of the largest term
    pub fn dominant(&self) -> &'static str {
        let terms = [
            ("volume", self.volume),
            ("volatility", self.volatility),
            ("decoupling", self.decoupling),
            ("rsi", self.rsi),
        ];
        terms
            .iter()
            .fold(("volume", f64::MIN), |best, &t| if t.1 > best.1 { t } else { best })
            .0
    }
}

/// Threshold-based detector
#[derive(Debug, Clone)]
pub struct StatisticalDetector {
    config: StatisticalConfig,
    calibrator: ScoreCalibrator,
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self::new(StatisticalConfig::default())
    }
}

impl StatisticalDetector {
    pub fn new(config: StatisticalConfig) -> Self {
        let calibrator =
            ScoreCalibrator::linear(config.normalization_floor, config.normalization_ceiling);
        Self { config, calibrator }
    }

    pub fn config(&self) -> &StatisticalConfig {
        &self.config
    }

    /// Per-term scores for one vector
    pub fn breakdown(&self, fv: &FeatureVector) -> StatisticalBreakdown {
        let c = &self.config;

        let volume = fv.volume_zscore().abs() / c.volume_z_threshold;

        let volatility = (fv.volatility_ratio() - c.volatility_ratio_threshold).max(0.0)
            / c.volatility_ratio_threshold;

        let corr = fv.volume_price_correlation();
        let decoupling =
            if corr < c.correlation_threshold && fv.volume_zscore() >= c.correlation_min_volume_z {
                1.0 - corr
            } else {
                0.0
            };

        let band = c.rsi_upper - 50.0;
        let rsi = ((fv.rsi() - 50.0).abs() - band).max(0.0) / (100.0 - c.rsi_upper);

        StatisticalBreakdown {
            volume,
            volatility,
            decoupling,
            rsi,
        }
    }
}

impl Detector for StatisticalDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Statistical
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<DetectorScore> {
        let value = self.breakdown(input.point).max_term();
        Ok(DetectorScore::new(DetectorId::Statistical, value))
    }

    fn normalize(&self, score: &DetectorScore) -> NormalizedScore {
        NormalizedScore::new(DetectorId::Statistical, self.calibrator.calibrate(score.value))
    }
}
