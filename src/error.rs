//! Error taxonomy for the scoring core
//!
//! Input and configuration errors always reach the caller. Model availability
//! problems are absorbed by the ensemble and only show up on verdicts.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ml::DetectorId;

/// Malformed bar sequences, rejected before feature extraction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("ticker symbol is empty")]
    EmptyTicker,

    #[error("bar {index}: timestamp {current} does not follow {previous}")]
    NonMonotonicTimestamp {
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("bar {index}: field `{field}` is not a finite number")]
    NonFiniteField { index: usize, field: &'static str },

    #[error("bar {index}: negative volume {volume}")]
    NegativeVolume { index: usize, volume: f64 },

    #[error("bar {index}: price field `{field}` must be positive, got {value}")]
    NonPositivePrice {
        index: usize,
        field: &'static str,
        value: f64,
    },

    #[error("bar {index}: high {high} is below low {low}")]
    InvertedRange { index: usize, high: f64, low: f64 },

    #[error("bar {index}: close {close} outside [{low}, {high}]")]
    CloseOutsideRange {
        index: usize,
        close: f64,
        low: f64,
        high: f64,
    },
}

/// Invalid setup. Raised when configuration or artifacts are loaded, never mid-scoring.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("ensemble weights must sum to 1.0, got {sum}")]
    WeightSum { sum: f64 },

    #[error("weight for {detector} must be finite and non-negative, got {weight}")]
    InvalidWeight { detector: DetectorId, weight: f64 },

    #[error("window length must be at least 1, got {0}")]
    InvalidWindowLength(usize),

    #[error("decision threshold must lie in [0, 1], got {0}")]
    DecisionThreshold(f64),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("feature dimensionality mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("artifact type tag `{found}` cannot be loaded by the {expected} detector")]
    ArtifactKindMismatch { expected: DetectorId, found: String },

    #[error("artifact was trained with window length {artifact}, engine uses {configured}")]
    WindowMismatch { artifact: usize, configured: usize },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// A trained detector cannot produce scores.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelUnavailable {
    #[error("no artifact loaded for the {0} detector")]
    NotLoaded(DetectorId),

    #[error("artifact could not be decoded: {0}")]
    Undecodable(String),

    #[error("artifact checksum mismatch: recorded {recorded}, computed {computed}")]
    ChecksumMismatch { recorded: String, computed: String },

    #[error("artifact for the {detector} detector is corrupt: {reason}")]
    Corrupt { detector: DetectorId, reason: String },
}

/// Umbrella error for the crate.
#[derive(Debug, Error)]
pub enum SurveillanceError {
    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("model unavailable: {0}")]
    ModelUnavailable(#[from] ModelUnavailable),

    #[error("window length mismatch: expected {expected}, got {got}")]
    WindowLength { expected: usize, got: usize },

    #[error("not enough training data: need {needed}, got {got}")]
    InsufficientTrainingData { needed: usize, got: usize },

    #[error("scoring request cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SurveillanceError>;

impl SurveillanceError {
    /// Whether the ensemble may absorb this error as a missing detector.
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, SurveillanceError::ModelUnavailable(_))
    }
}
