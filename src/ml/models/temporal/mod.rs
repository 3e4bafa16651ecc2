//! Temporal Sequence Analysis
//!
//! Scores a point by how well its feature vector can be predicted from the
//! vectors around it in the trailing window. Manipulation that unfolds over
//! several bars breaks the learned dynamics even when each bar looks
//! unremarkable on its own.
//!
//! # Architecture
//! ```text
//! Window (W x 6) -> BiLSTM over the first W-1 steps -> linear readout -> prediction error
//! ```

pub mod lstm;
pub mod window;

pub use lstm::{SequenceConfig, SequenceModel, SequenceNetwork};
pub use window::{clean_windows, has_quiescent, trailing_window};

use std::sync::Arc;

use super::check_artifact;
use crate::error::{ConfigError, ModelUnavailable, Result, SurveillanceError};
use crate::ml::backend::{self, Cpu};
use crate::ml::artifact::{ArtifactKind, ModelParams, ModelVersion, TrainedModelArtifact};
use crate::ml::{
    Detector, DetectorId, DetectorScore, NormalizedScore, ScoringInput, Unavailability,
};

/// Sequence detector backed by a BiLSTM artifact
#[derive(Debug, Clone)]
pub struct SequenceDetector {
    artifact: Arc<TrainedModelArtifact>,
    window_length: usize,
}

impl SequenceDetector {
    /// The artifact must have been trained with the engine's window length.
    pub fn from_artifact(
        artifact: Arc<TrainedModelArtifact>,
        window_length: usize,
    ) -> std::result::Result<Self, ConfigError> {
        check_artifact(&artifact, ArtifactKind::Sequence)?;
        let trained = match artifact.params() {
            ModelParams::Sequence(model) => model.window_length(),
            _ => artifact.metadata().window_length,
        };
        if trained != window_length {
            return Err(ConfigError::WindowMismatch {
                artifact: trained,
                configured: window_length,
            });
        }
        Ok(Self {
            artifact,
            window_length,
        })
    }

    pub fn artifact(&self) -> &Arc<TrainedModelArtifact> {
        &self.artifact
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    fn model(&self) -> Result<&SequenceModel> {
        match self.artifact.params() {
            ModelParams::Sequence(model) => Ok(model),
            _ => Err(ModelUnavailable::Corrupt {
                detector: DetectorId::Sequence,
                reason: "parameters do not hold a sequence model".to_string(),
            }
            .into()),
        }
    }
}

impl Detector for SequenceDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Sequence
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<DetectorScore> {
        let window = input.window.unwrap_or_default();
        if window.len() != self.window_length {
            return Err(SurveillanceError::WindowLength {
                expected: self.window_length,
                got: window.len(),
            });
        }

        let scaler = self.artifact.scaler();
        let steps = window
            .iter()
            .map(|fv| scaler.transform(fv.as_slice()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let model = self.model()?;
        let network: SequenceNetwork<Cpu> =
            backend::cached_module(self.artifact.checksum(), || Ok(model.network()?))?;
        let value = model.score_with(&network, &steps)?;
        Ok(DetectorScore::new(DetectorId::Sequence, value))
    }

    fn normalize(&self, score: &DetectorScore) -> NormalizedScore {
        NormalizedScore::new(DetectorId::Sequence, self.artifact.calibrator().calibrate(score.value))
    }

    fn abstain_reason(&self, input: &ScoringInput<'_>) -> Option<Unavailability> {
        match input.window {
            None => Some(Unavailability::WarmUp),
            Some(w) if input.point.quiescent || has_quiescent(w) => {
                Some(Unavailability::QuiescentInput)
            }
            Some(_) => None,
        }
    }

    fn model_version(&self) -> Option<ModelVersion> {
        Some(self.artifact.version().clone())
    }
}
