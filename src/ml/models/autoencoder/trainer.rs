//! Autoencoder Training
//!
//! Mini-batch Adam on mean squared reconstruction error, with early stopping
//! once the epoch loss stops improving. Gradients come from burn's autodiff
//! backend; the trained network is stored through its record.

use std::collections::VecDeque;

use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::ElementConversion;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::network::{Autoencoder, AutoencoderConfig, AutoencoderNetwork};
use crate::error::{ConfigError, Result, SurveillanceError};
use crate::ml::backend::{self, CpuAutodiff};

/// Training data for the autoencoder (standardized rows)
#[derive(Debug, Clone, Default)]
pub struct AutoencoderDataset {
    samples: Vec<Vec<f64>>,
}

impl AutoencoderDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        Self { samples: rows }
    }

    pub fn add(&mut self, row: Vec<f64>) {
        self.samples.push(row);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Vec<f64>] {
        &self.samples
    }
}

/// Training progress information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Current epoch
    pub epoch: usize,
    /// Maximum epochs
    pub total_epochs: usize,
    /// Average loss for current epoch
    pub epoch_loss: f64,
    /// Best loss seen so far
    pub best_loss: f64,
    /// Training complete
    pub complete: bool,
}

impl TrainingProgress {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_loss: f64::MAX,
            best_loss: f64::MAX,
            complete: false,
        }
    }
}

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainedAutoencoder {
    pub model: Autoencoder,
    pub final_loss: f64,
    pub best_loss: f64,
    pub epochs_trained: usize,
    pub stopped_early: bool,
}

/// Autoencoder trainer
#[derive(Debug)]
pub struct AutoencoderTrainer {
    config: AutoencoderConfig,
    /// Loss history for monitoring
    loss_history: VecDeque<f64>,
    /// Maximum history length
    max_history: usize,
}

impl AutoencoderTrainer {
    pub fn new(config: AutoencoderConfig) -> Self {
        Self {
            config,
            loss_history: VecDeque::with_capacity(1000),
            max_history: 1000,
        }
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }

    /// Record a loss value
    pub fn record_loss(&mut self, loss: f64) {
        if self.loss_history.len() >= self.max_history {
            self.loss_history.pop_front();
        }
        self.loss_history.push_back(loss);
    }

    /// Get average recent loss
    pub fn average_loss(&self) -> f64 {
        if self.loss_history.is_empty() {
            return 0.0;
        }
        self.loss_history.iter().sum::<f64>() / self.loss_history.len() as f64
    }

    /// Check for early stopping (loss not improving)
    pub fn should_stop_early(&self, patience: usize) -> bool {
        if patience == 0 || self.loss_history.len() < patience * 2 {
            return false;
        }

        let recent_min = self
            .loss_history
            .iter()
            .rev()
            .take(patience)
            .copied()
            .fold(f64::MAX, f64::min);
        let older_min = self
            .loss_history
            .iter()
            .rev()
            .skip(patience)
            .copied()
            .fold(f64::MAX, f64::min);

        // Stop if recent min is not better than everything before it
        recent_min >= older_min
    }

    /// Train a fresh network on the dataset
    pub fn train(&mut self, dataset: &AutoencoderDataset, seed: u64) -> Result<TrainedAutoencoder> {
        let Some(first) = dataset.samples().first() else {
            return Err(SurveillanceError::InsufficientTrainingData { needed: 1, got: 0 });
        };
        let input_dim = first.len();
        if let Some(bad) = dataset.samples().iter().find(|r| r.len() != input_dim) {
            return Err(ConfigError::DimensionMismatch {
                expected: input_dim,
                got: bad.len(),
            }
            .into());
        }

        let device = backend::device();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model =
            AutoencoderNetwork::<CpuAutodiff>::new(input_dim, &self.config, &mut rng, &device);
        let mut optim = AdamConfig::new().init::<CpuAutodiff, AutoencoderNetwork<CpuAutodiff>>();
        let loss_fn = MseLoss::new();

        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut progress = TrainingProgress::new(self.config.epochs);
        let mut stopped_early = false;

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;

            for batch in order.chunks(self.config.batch_size.max(1)) {
                let rows = batch.iter().map(|&i| dataset.samples()[i].as_slice());
                let x = backend::matrix::<CpuAutodiff>(rows, input_dim, &device)?;
                let reconstructed = model.forward(x.clone());
                let loss = loss_fn.forward(reconstructed, x, Reduction::Mean);

                epoch_loss += loss.clone().into_scalar().elem::<f64>() * batch.len() as f64;
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(self.config.learning_rate, model, grads);
            }

            epoch_loss /= dataset.len() as f64;
            progress.epoch = epoch + 1;
            progress.epoch_loss = epoch_loss;
            progress.best_loss = progress.best_loss.min(epoch_loss);
            self.record_loss(epoch_loss);
            debug!(epoch = progress.epoch, loss = epoch_loss, "autoencoder epoch");

            if self.should_stop_early(self.config.patience) {
                stopped_early = true;
                break;
            }
        }
        progress.complete = true;

        Ok(TrainedAutoencoder {
            model: Autoencoder::from_network(input_dim, self.config.clone(), model.valid())?,
            final_loss: progress.epoch_loss,
            best_loss: progress.best_loss,
            epochs_trained: progress.epoch,
            stopped_early,
        })
    }
}
