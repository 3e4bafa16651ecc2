//! Machine learning pipeline for manipulation scoring
//!
//! Provides:
//! - Feature extraction from OHLCV bars
//! - Four detectors behind the [`Detector`] trait
//! - Versioned, checksummed model artifacts
//! - Offline training of the trainable detectors
//! - Ensemble fusion with per-detector attribution

pub mod artifact;
pub mod backend;
pub mod features;
pub mod models;
pub mod normalization;
pub mod training;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use artifact::ModelVersion;
use features::FeatureVector;

/// Identifies one detector in the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorId {
    Statistical,
    Outlier,
    Reconstruction,
    Sequence,
}

impl DetectorId {
    pub const ALL: [DetectorId; 4] = [
        DetectorId::Statistical,
        DetectorId::Outlier,
        DetectorId::Reconstruction,
        DetectorId::Sequence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorId::Statistical => "statistical",
            DetectorId::Outlier => "outlier",
            DetectorId::Reconstruction => "reconstruction",
            DetectorId::Sequence => "sequence",
        }
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector output on its own native scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorScore {
    pub detector: DetectorId,
    pub value: f64,
}

impl DetectorScore {
    pub fn new(detector: DetectorId, value: f64) -> Self {
        Self { detector, value }
    }
}

/// Detector output mapped onto [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedScore {
    pub detector: DetectorId,
    pub value: f64,
}

impl NormalizedScore {
    /// Clamps into [0, 1]; NaN maps to 0.
    pub fn new(detector: DetectorId, value: f64) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self { detector, value }
    }
}

/// What a detector sees for one scoring point
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    /// Feature vector at the scoring point
    pub point: &'a FeatureVector,
    /// Trailing window ending at `point`, when enough history exists
    pub window: Option<&'a [FeatureVector]>,
}

impl<'a> ScoringInput<'a> {
    pub fn point(point: &'a FeatureVector) -> Self {
        Self { point, window: None }
    }

    pub fn with_window(point: &'a FeatureVector, window: &'a [FeatureVector]) -> Self {
        Self {
            point,
            window: Some(window),
        }
    }
}

/// Why a detector produced no score for a point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum Unavailability {
    /// No artifact was attached
    NotLoaded,
    /// Artifact failed to decode or verify
    Corrupt(String),
    /// Not enough feature history for the detector's window
    WarmUp,
    /// Input consists of zero-dispersion guard values the model never saw
    QuiescentInput,
}

/// Shared capability of all detectors. The fuser never sees anything else.
pub trait Detector: Send + Sync {
    fn id(&self) -> DetectorId;

    /// Score the final point of the input on the detector's native scale
    fn score(&self, input: &ScoringInput<'_>) -> Result<DetectorScore>;

    /// Map a native score onto [0, 1], monotonically
    fn normalize(&self, score: &DetectorScore) -> NormalizedScore;

    /// Reason to skip this input instead of scoring it
    fn abstain_reason(&self, _input: &ScoringInput<'_>) -> Option<Unavailability> {
        None
    }

    /// Version of the backing artifact, for trained detectors
    fn model_version(&self) -> Option<ModelVersion> {
        None
    }
}

/// Per-detector result handed to the fuser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorOutcome {
    Scored {
        raw: DetectorScore,
        normalized: NormalizedScore,
    },
    Unavailable(Unavailability),
}

impl DetectorOutcome {
    /// Run one detector against one input, absorbing missing-model failures.
    ///
    /// Configuration and contract errors still propagate.
    pub fn evaluate(detector: &dyn Detector, input: &ScoringInput<'_>) -> Result<Self> {
        if let Some(reason) = detector.abstain_reason(input) {
            return Ok(DetectorOutcome::Unavailable(reason));
        }
        match detector.score(input) {
            Ok(raw) => Ok(DetectorOutcome::Scored {
                normalized: detector.normalize(&raw),
                raw,
            }),
            Err(e) if e.is_model_unavailable() => {
                Ok(DetectorOutcome::Unavailable(Unavailability::Corrupt(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    pub fn normalized(&self) -> Option<f64> {
        match self {
            DetectorOutcome::Scored { normalized, .. } => Some(normalized.value),
            DetectorOutcome::Unavailable(_) => None,
        }
    }
}
