//! Ensemble Fusion
//!
//! Combines the four detectors into one calibrated confidence per point,
//! with a pattern label and a full attribution of the confidence to the
//! detectors that produced it.
//!
//! # Default Ensemble Weights
//! | Detector | Weight | Purpose |
//! |----------|--------|---------|
//! | Statistical | 30% | Auditable thresholds, always available |
//! | Outlier (isolation forest) | 25% | Isolation of rare feature combinations |
//! | Reconstruction (autoencoder) | 25% | Departure from the learned feature manifold |
//! | Sequence | 20% | Broken temporal dynamics |
//!
//! # Usage
//! ```ignore
//! use tapewatch::ml::models::ensemble::{EnsembleConfig, EnsembleFuser};
//!
//! let fuser = EnsembleFuser::new(EnsembleConfig::default(), &PatternConfig::default())?;
//! let verdict = fuser.fuse("ACME", &features, &outcomes, &versions, Some(breakdown));
//! if verdict.is_flagged() {
//!     println!("{} at {}: {}", verdict.ticker, verdict.timestamp, verdict.label);
//! }
//! ```

pub mod calibration;
pub mod patterns;
pub mod voting;

pub use calibration::{CalibrationMethod, ScoreCalibrator};
pub use patterns::{
    MarkingRule, PatternClassifier, PatternConfig, PatternLabel, PatternMatch, PatternRule,
    PumpRule, WashRule,
};
pub use voting::{FusedVote, ModelVote, VoteAggregator};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::statistical::StatisticalBreakdown;
use crate::error::ConfigError;
use crate::ml::artifact::ModelVersion;
use crate::ml::features::FeatureVector;
use crate::ml::{DetectorId, DetectorOutcome, Unavailability};

/// Tolerance for the weight sum check
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Configured detector weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleWeights {
    pub statistical: f64,
    pub outlier: f64,
    pub reconstruction: f64,
    pub sequence: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            statistical: 0.30,
            outlier: 0.25,
            reconstruction: 0.25,
            sequence: 0.20,
        }
    }
}

impl EnsembleWeights {
    /// Weights in (statistical, outlier, reconstruction, sequence) order
    pub fn from_tuple(weights: (f64, f64, f64, f64)) -> Self {
        Self {
            statistical: weights.0,
            outlier: weights.1,
            reconstruction: weights.2,
            sequence: weights.3,
        }
    }

    pub fn get(&self, id: DetectorId) -> f64 {
        match id {
            DetectorId::Statistical => self.statistical,
            DetectorId::Outlier => self.outlier,
            DetectorId::Reconstruction => self.reconstruction,
            DetectorId::Sequence => self.sequence,
        }
    }

    pub fn sum(&self) -> f64 {
        DetectorId::ALL.iter().map(|&id| self.get(id)).sum()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for id in DetectorId::ALL {
            let weight = self.get(id);
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    detector: id,
                    weight,
                });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }
}

/// Ensemble configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub weights: EnsembleWeights,
    /// Confidence at or above which a pattern label is assigned
    pub decision_threshold: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weights: EnsembleWeights::default(),
            decision_threshold: 0.5,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(ConfigError::DecisionThreshold(self.decision_threshold));
        }
        Ok(())
    }
}

/// Fused, explained result for one (ticker, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleVerdict {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    /// Fused confidence in [0, 1]
    pub confidence: f64,
    pub label: PatternLabel,
    /// Why the label was assigned
    pub rationale: Option<String>,
    /// Effective weight times normalized score; sums to `confidence`
    pub contributions: BTreeMap<DetectorId, f64>,
    pub effective_weights: BTreeMap<DetectorId, f64>,
    /// Native-scale scores of the detectors that ran
    pub raw_scores: BTreeMap<DetectorId, f64>,
    /// Normalized scores of the detectors that ran
    pub normalized_scores: BTreeMap<DetectorId, f64>,
    /// At least one detector was unavailable
    pub partial: bool,
    pub missing: Vec<DetectorId>,
    pub missing_reasons: BTreeMap<DetectorId, Unavailability>,
    /// Artifact versions of the trained detectors that contributed
    pub model_versions: BTreeMap<DetectorId, ModelVersion>,
    pub features: FeatureVector,
    pub statistical: Option<StatisticalBreakdown>,
}

impl EnsembleVerdict {
    /// Confidence cleared the threshold and a pattern was named
    pub fn is_flagged(&self) -> bool {
        !self.label.is_none()
    }

    /// Detector with the largest contribution
    pub fn dominant_detector(&self) -> Option<DetectorId> {
        self.contributions
            .iter()
            .fold(None, |best: Option<(DetectorId, f64)>, (&id, &c)| match best {
                Some((_, b)) if b >= c => best,
                _ => Some((id, c)),
            })
            .map(|(id, _)| id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Deterministic fusion policy
#[derive(Debug)]
pub struct EnsembleFuser {
    config: EnsembleConfig,
    classifier: PatternClassifier,
}

impl EnsembleFuser {
    pub fn new(config: EnsembleConfig, patterns: &PatternConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        patterns.validate()?;
        Ok(Self {
            config,
            classifier: PatternClassifier::from_config(patterns),
        })
    }

    /// Replace the rule set
    pub fn with_classifier(mut self, classifier: PatternClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn classifier(&self) -> &PatternClassifier {
        &self.classifier
    }

    /// Fuse per-detector outcomes for one point.
    ///
    /// Detectors absent from `outcomes` count as not loaded.
    pub fn fuse(
        &self,
        ticker: &str,
        features: &FeatureVector,
        outcomes: &BTreeMap<DetectorId, DetectorOutcome>,
        model_versions: &BTreeMap<DetectorId, ModelVersion>,
        statistical: Option<StatisticalBreakdown>,
    ) -> EnsembleVerdict {
        let mut aggregator = VoteAggregator::new();
        let mut raw_scores = BTreeMap::new();
        let mut normalized_scores = BTreeMap::new();
        let mut missing_reasons = BTreeMap::new();

        for id in DetectorId::ALL {
            let weight = self.config.weights.get(id);
            match outcomes.get(&id) {
                Some(DetectorOutcome::Scored { raw, normalized }) => {
                    raw_scores.insert(id, raw.value);
                    normalized_scores.insert(id, normalized.value);
                    aggregator.add_vote(ModelVote::new(id, normalized.value, weight));
                }
                Some(DetectorOutcome::Unavailable(reason)) => {
                    missing_reasons.insert(id, reason.clone());
                    aggregator.add_vote(ModelVote::unavailable(id, weight));
                }
                None => {
                    missing_reasons.insert(id, Unavailability::NotLoaded);
                    aggregator.add_vote(ModelVote::unavailable(id, weight));
                }
            }
        }

        let fused = aggregator.aggregate();

        let matched = if fused.confidence >= self.config.decision_threshold {
            self.classifier.classify(features)
        } else {
            None
        };
        let (label, rationale) = match matched {
            Some(m) => (m.label, Some(m.rationale)),
            None => (PatternLabel::None, None),
        };

        let model_versions = model_versions
            .iter()
            .filter(|(id, _)| fused.contributions.contains_key(id))
            .map(|(id, v)| (*id, v.clone()))
            .collect();

        EnsembleVerdict {
            ticker: ticker.to_string(),
            timestamp: features.timestamp,
            confidence: fused.confidence,
            label,
            rationale,
            contributions: fused.contributions,
            effective_weights: fused.effective_weights,
            raw_scores,
            normalized_scores,
            partial: !fused.missing.is_empty(),
            missing: fused.missing,
            missing_reasons,
            model_versions,
            features: features.clone(),
            statistical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{DetectorScore, NormalizedScore};
    use chrono::TimeZone;

    fn scored(id: DetectorId, value: f64) -> DetectorOutcome {
        DetectorOutcome::Scored {
            raw: DetectorScore::new(id, value),
            normalized: NormalizedScore::new(id, value),
        }
    }

    fn features(values: [f64; 6]) -> FeatureVector {
        FeatureVector::new(60, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(), values)
    }

    fn fuser() -> EnsembleFuser {
        EnsembleFuser::new(EnsembleConfig::default(), &PatternConfig::default()).unwrap()
    }

    #[test]
    fn test_weights_validation() {
        assert!(EnsembleWeights::default().validate().is_ok());
        assert!(matches!(
            EnsembleWeights::from_tuple((0.4, 0.4, 0.4, 0.4)).validate(),
            Err(ConfigError::WeightSum { .. })
        ));
        assert!(matches!(
            EnsembleWeights::from_tuple((1.2, -0.2, 0.0, 0.0)).validate(),
            Err(ConfigError::InvalidWeight {
                detector: DetectorId::Outlier,
                ..
            })
        ));
        assert!(EnsembleWeights::from_tuple((f64::NAN, 0.5, 0.5, 0.0)).validate().is_err());
    }

    #[test]
    fn test_full_verdict() {
        let outcomes: BTreeMap<_, _> = [
            (DetectorId::Statistical, scored(DetectorId::Statistical, 1.0)),
            (DetectorId::Outlier, scored(DetectorId::Outlier, 0.8)),
            (DetectorId::Reconstruction, scored(DetectorId::Reconstruction, 0.6)),
            (DetectorId::Sequence, scored(DetectorId::Sequence, 0.4)),
        ]
        .into_iter()
        .collect();
        let fv = features([4.0, 1.0, 0.05, 55.0, 0.0, 0.5]);
        let verdict = fuser().fuse("ACME", &fv, &outcomes, &BTreeMap::new(), None);

        // 0.30 + 0.20 + 0.15 + 0.08
        assert!((verdict.confidence - 0.73).abs() < 1e-9);
        assert_eq!(verdict.label, PatternLabel::WashTrading);
        assert!(verdict.rationale.is_some());
        assert!(!verdict.partial);
        assert_eq!(verdict.dominant_detector(), Some(DetectorId::Statistical));
        let sum: f64 = verdict.contributions.values().sum();
        assert!((sum - verdict.confidence).abs() < 1e-12);
    }

    #[test]
    fn test_missing_detectors_make_partial_verdict() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(DetectorId::Statistical, scored(DetectorId::Statistical, 0.2));
        outcomes.insert(
            DetectorId::Sequence,
            DetectorOutcome::Unavailable(Unavailability::WarmUp),
        );
        let fv = features([0.0, 1.0, 0.5, 50.0, 0.0, 0.0]);
        let verdict = fuser().fuse("ACME", &fv, &outcomes, &BTreeMap::new(), None);

        assert!(verdict.partial);
        assert_eq!(
            verdict.missing,
            vec![DetectorId::Outlier, DetectorId::Reconstruction, DetectorId::Sequence]
        );
        assert_eq!(verdict.missing_reasons[&DetectorId::Sequence], Unavailability::WarmUp);
        assert_eq!(verdict.missing_reasons[&DetectorId::Outlier], Unavailability::NotLoaded);
        assert_eq!(verdict.effective_weights[&DetectorId::Statistical], 1.0);
        assert!((verdict.confidence - 0.2).abs() < 1e-12);
        assert_eq!(verdict.label, PatternLabel::None);
    }

    #[test]
    fn test_high_confidence_without_rule_is_none() {
        let outcomes: BTreeMap<_, _> = DetectorId::ALL
            .into_iter()
            .map(|id| (id, scored(id, 0.9)))
            .collect();
        // nothing in the features matches a rule
        let fv = features([0.5, 3.0, 0.5, 50.0, 0.0, 0.0]);
        let verdict = fuser().fuse("ACME", &fv, &outcomes, &BTreeMap::new(), None);
        assert!(verdict.confidence >= 0.5);
        assert_eq!(verdict.label, PatternLabel::None);
        assert!(!verdict.is_flagged());
    }

    #[test]
    fn test_model_versions_only_for_contributors() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(DetectorId::Statistical, scored(DetectorId::Statistical, 0.1));
        outcomes.insert(DetectorId::Outlier, scored(DetectorId::Outlier, 0.1));
        let versions: BTreeMap<_, _> = [
            (DetectorId::Outlier, ModelVersion::new(1, 0, 0)),
            (DetectorId::Sequence, ModelVersion::new(2, 0, 0)),
        ]
        .into_iter()
        .collect();
        let fv = features([0.0; 6]);
        let verdict = fuser().fuse("ACME", &fv, &outcomes, &versions, None);
        assert_eq!(verdict.model_versions.len(), 1);
        assert!(verdict.model_versions.contains_key(&DetectorId::Outlier));
    }

    #[test]
    fn test_verdict_json_export() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(DetectorId::Statistical, scored(DetectorId::Statistical, 0.3));
        let fv = features([0.0; 6]);
        let verdict = fuser().fuse("ACME", &fv, &outcomes, &BTreeMap::new(), None);
        let json = verdict.to_json().unwrap();
        assert!(json.contains("\"label\":\"none\""));
        let back: EnsembleVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ticker, verdict.ticker);
        assert_eq!(back.timestamp, verdict.timestamp);
        assert_eq!(back.missing, verdict.missing);
        assert!((back.confidence - verdict.confidence).abs() < 1e-12);
    }
}
