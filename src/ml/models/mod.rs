//! Detector implementations
//!
//! The statistical detector runs from configuration alone. The outlier,
//! reconstruction and sequence detectors wrap a [`TrainedModelArtifact`]
//! shared by `Arc`.

pub mod autoencoder;
pub mod ensemble;
pub mod isolation_forest;
pub mod statistical;
pub mod temporal;

pub use autoencoder::{Autoencoder, ReconstructionDetector};
pub use isolation_forest::{IsolationForest, OutlierDetector};
pub use statistical::{StatisticalBreakdown, StatisticalDetector};
pub use temporal::{SequenceDetector, SequenceModel};

use crate::error::ConfigError;
use crate::ml::artifact::{ArtifactKind, TrainedModelArtifact};
use crate::ml::features::{FeatureVector, NUM_FEATURES};
use crate::ml::Unavailability;

/// Reject artifacts of the wrong kind or feature width
pub(crate) fn check_artifact(
    artifact: &TrainedModelArtifact,
    expected: ArtifactKind,
) -> Result<(), ConfigError> {
    if artifact.kind() != expected {
        return Err(ConfigError::ArtifactKindMismatch {
            expected: expected.detector(),
            found: artifact.kind().tag().to_string(),
        });
    }
    if artifact.feature_dim() != NUM_FEATURES {
        return Err(ConfigError::DimensionMismatch {
            expected: NUM_FEATURES,
            got: artifact.feature_dim(),
        });
    }
    Ok(())
}

/// Trained models never saw zero-dispersion guard values; they abstain on them.
pub(crate) fn quiescent_input(point: &FeatureVector) -> Option<Unavailability> {
    point.quiescent.then_some(Unavailability::QuiescentInput)
}
