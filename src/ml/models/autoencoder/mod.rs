//! Autoencoder-based Anomaly Detection
//!
//! Uses reconstruction error to detect anomalies. Normal bars should
//! reconstruct well while manipulated bars leave a larger residual.
//!
//! # Architecture
//! ```text
//! Input (6D) -> 16 -> 8 -> 3 (latent) -> 8 -> 16 -> Output (6D)
//! ```
//!
//! The network is a burn module. Artifacts carry its record and each scoring
//! thread decodes it once.
//!
//! # Usage
//! ```ignore
//! use tapewatch::ml::models::autoencoder::{AutoencoderConfig, AutoencoderDataset, AutoencoderTrainer};
//!
//! let mut trainer = AutoencoderTrainer::new(AutoencoderConfig::default());
//! let trained = trainer.train(&AutoencoderDataset::from_rows(standardized_rows), 42)?;
//! let error = trained.model.reconstruction_error(&row)?;
//! ```

pub mod network;
pub mod trainer;

pub use network::{Autoencoder, AutoencoderConfig, AutoencoderNetwork};
pub use trainer::{AutoencoderDataset, AutoencoderTrainer, TrainedAutoencoder, TrainingProgress};

use std::sync::Arc;

use super::{check_artifact, quiescent_input};
use crate::error::{ConfigError, ModelUnavailable, Result};
use crate::ml::backend::{self, Cpu};
use crate::ml::artifact::{ArtifactKind, ModelParams, ModelVersion, TrainedModelArtifact};
use crate::ml::{
    Detector, DetectorId, DetectorScore, NormalizedScore, ScoringInput, Unavailability,
};

/// Reconstruction detector backed by an autoencoder artifact
#[derive(Debug, Clone)]
pub struct ReconstructionDetector {
    artifact: Arc<TrainedModelArtifact>,
}

impl ReconstructionDetector {
    pub fn from_artifact(artifact: Arc<TrainedModelArtifact>) -> std::result::Result<Self, ConfigError> {
        check_artifact(&artifact, ArtifactKind::Autoencoder)?;
        Ok(Self { artifact })
    }

    pub fn artifact(&self) -> &Arc<TrainedModelArtifact> {
        &self.artifact
    }

    fn model(&self) -> Result<&Autoencoder> {
        match self.artifact.params() {
            ModelParams::Autoencoder(net) => Ok(net),
            _ => Err(ModelUnavailable::Corrupt {
                detector: DetectorId::Reconstruction,
                reason: "parameters do not hold an autoencoder".to_string(),
            }
            .into()),
        }
    }
}

impl Detector for ReconstructionDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Reconstruction
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<DetectorScore> {
        let row = self.artifact.scaler().transform(input.point.as_slice())?;
        let model = self.model()?;
        let network: AutoencoderNetwork<Cpu> =
            backend::cached_module(self.artifact.checksum(), || Ok(model.network()?))?;
        let value = model.error_with(&network, &row)?;
        Ok(DetectorScore::new(DetectorId::Reconstruction, value))
    }

    fn normalize(&self, score: &DetectorScore) -> NormalizedScore {
        NormalizedScore::new(
            DetectorId::Reconstruction,
            self.artifact.calibrator().calibrate(score.value),
        )
    }

    fn abstain_reason(&self, input: &ScoringInput<'_>) -> Option<Unavailability> {
        quiescent_input(input.point)
    }

    fn model_version(&self) -> Option<ModelVersion> {
        Some(self.artifact.version().clone())
    }
}
