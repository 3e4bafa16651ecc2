//! tapewatch: ensemble anomaly scoring for market-manipulation surveillance.
//!
//! Raw OHLCV bars are turned into six-feature vectors, scored by four detectors
//! of different character (statistical thresholds, isolation forest,
//! autoencoder reconstruction, bidirectional sequence model) and fused into an
//! explained verdict per (ticker, timestamp).

pub mod config;
pub mod engine;
pub mod error;
pub mod market;
pub mod ml;
pub mod parallel;
pub mod testing;
pub mod tracking;

pub use config::Config;
pub use engine::{CancelFlag, Explanation, ScoringEngine};
pub use error::{ConfigError, InputError, ModelUnavailable, Result, SurveillanceError};
pub use market::{BarSeries, RawBar, TimeRange};
pub use ml::artifact::{ArtifactKind, ModelVersion, TrainedModelArtifact};
pub use ml::features::{FeatureExtractor, FeatureVector, FEATURE_NAMES, NUM_FEATURES};
pub use ml::models::ensemble::{EnsembleFuser, EnsembleVerdict, PatternLabel};
pub use ml::training::{ModelTrainer, TrainedModels, TrainingSet};
pub use ml::{Detector, DetectorId, DetectorScore, NormalizedScore};
pub use tracking::{EventSink, MemorySink, NoopSink, TrackingEvent};
