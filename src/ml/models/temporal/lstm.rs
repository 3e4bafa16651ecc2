//! Bidirectional LSTM sequence model
//!
//! A forward and a reverse LSTM read the first `W - 1` steps of a window.
//! A linear readout over both final hidden states predicts the last step and
//! the anomaly score is the squared error of that prediction. A window of a
//! single step has no history, so the network reads one zero step and the
//! readout learns the typical step.

use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{BiLstm, Linear};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{check_positive, check_range};
use crate::error::{ConfigError, ModelUnavailable, Result, SurveillanceError};
use crate::ml::backend::{self, seeded_bilstm, seeded_linear, Cpu, CpuAutodiff, ParamIds};

/// Sequence model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Hidden units per direction
    pub hidden_units: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Training windows beyond this are thinned evenly
    pub max_training_windows: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            hidden_units: 16,
            learning_rate: 0.01,
            batch_size: 64,
            epochs: 8,
            max_training_windows: 2000,
        }
    }
}

impl SequenceConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_range("sequence.hidden_units", self.hidden_units as f64, 1.0, 1024.0)?;
        check_positive("sequence.learning_rate", self.learning_rate)?;
        check_range("sequence.batch_size", self.batch_size as f64, 1.0, 1e6)?;
        check_range("sequence.epochs", self.epochs as f64, 1.0, 1e6)?;
        check_range("sequence.max_training_windows", self.max_training_windows as f64, 1.0, 1e9)
    }
}

/// BiLSTM encoder plus linear next-step readout
#[derive(Module, Debug)]
pub struct SequenceNetwork<B: Backend> {
    lstm: BiLstm<B>,
    readout: Linear<B>,
}

impl<B: Backend> SequenceNetwork<B> {
    pub fn new<R: Rng>(input_dim: usize, hidden_units: usize, rng: &mut R, device: &B::Device) -> Self {
        let mut ids = ParamIds::new();
        let lstm = seeded_bilstm(input_dim, hidden_units, &mut ids, rng, device);
        let readout = seeded_linear(2 * hidden_units, input_dim, &mut ids, rng, device);
        Self { lstm, readout }
    }

    /// `[batch, steps, input_dim]` context to `[batch, input_dim]` prediction
    pub fn forward(&self, context: Tensor<B, 3>) -> Tensor<B, 2> {
        let (_, state) = self.lstm.forward(context, None);
        let [_, batch, hidden] = state.hidden.dims();
        let summary = state.hidden.swap_dims(0, 1).reshape([batch, 2 * hidden]);
        self.readout.forward(summary)
    }
}

/// Steps the network reads before predicting the last one
fn context_steps(window_length: usize) -> usize {
    window_length.saturating_sub(1).max(1)
}

/// Context and target tensors for windows already checked for shape
fn split_batch<B: Backend>(
    windows: &[&[Vec<f64>]],
    window_length: usize,
    input_dim: usize,
    device: &B::Device,
) -> Result<(Tensor<B, 3>, Tensor<B, 2>)> {
    let steps = context_steps(window_length);
    let mut context = Vec::with_capacity(windows.len() * steps * input_dim);
    for window in windows {
        if window_length < 2 {
            context.extend(std::iter::repeat(0.0f32).take(input_dim));
        } else {
            for step in &window[..window_length - 1] {
                context.extend(step.iter().map(|&v| v as f32));
            }
        }
    }
    let context = Tensor::from_data(
        TensorData::new(context, [windows.len(), steps, input_dim]),
        device,
    );
    let targets = backend::matrix(
        windows.iter().filter_map(|w| w.last()).map(|s| s.as_slice()),
        input_dim,
        device,
    )?;
    Ok((context, targets))
}

/// Fitted bidirectional sequence model over standardized steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceModel {
    input_dim: usize,
    window_length: usize,
    hidden_units: usize,
    record: Vec<u8>,
}

impl SequenceModel {
    /// Fit on windows of exactly `window_length` standardized steps.
    pub fn fit(
        windows: &[Vec<Vec<f64>>],
        window_length: usize,
        config: &SequenceConfig,
        seed: u64,
    ) -> Result<Self> {
        if window_length == 0 {
            return Err(ConfigError::InvalidWindowLength(window_length).into());
        }
        let Some(first) = windows.first() else {
            return Err(SurveillanceError::InsufficientTrainingData { needed: 1, got: 0 });
        };
        let input_dim = first.first().map(|s| s.len()).unwrap_or(0);
        let mut model = Self {
            input_dim,
            window_length,
            hidden_units: config.hidden_units,
            record: Vec::new(),
        };
        for w in windows {
            model.check_window(w)?;
        }

        let device = backend::device();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut network =
            SequenceNetwork::<CpuAutodiff>::new(input_dim, config.hidden_units, &mut rng, &device);
        let mut optim = AdamConfig::new().init::<CpuAutodiff, SequenceNetwork<CpuAutodiff>>();
        let loss_fn = MseLoss::new();
        let mut order: Vec<usize> = (0..windows.len()).collect();

        for epoch in 0..config.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;

            for chunk in order.chunks(config.batch_size.max(1)) {
                let batch: Vec<&[Vec<f64>]> = chunk.iter().map(|&i| windows[i].as_slice()).collect();
                let (context, target) =
                    split_batch::<CpuAutodiff>(&batch, window_length, input_dim, &device)?;
                let loss = loss_fn.forward(network.forward(context), target, Reduction::Mean);

                epoch_loss += loss.clone().into_scalar().elem::<f64>() * batch.len() as f64;
                let grads = GradientsParams::from_grads(loss.backward(), &network);
                network = optim.step(config.learning_rate, network, grads);
            }
            debug!(
                epoch = epoch + 1,
                loss = epoch_loss / windows.len() as f64,
                "sequence epoch"
            );
        }

        model.record = backend::encode_module(network.valid())?;
        Ok(model)
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Rebuild the network from the stored record
    pub fn network(&self) -> std::result::Result<SequenceNetwork<Cpu>, ModelUnavailable> {
        let skeleton = SequenceNetwork::new(
            self.input_dim,
            self.hidden_units,
            &mut StdRng::seed_from_u64(0),
            &backend::device(),
        );
        backend::decode_module(skeleton, &self.record)
    }

    /// Predicted final step
    pub fn predict(&self, window: &[Vec<f64>]) -> Result<Vec<f64>> {
        self.predict_with(&self.network()?, window)
    }

    /// Mean squared error between the predicted and actual final step
    pub fn score(&self, window: &[Vec<f64>]) -> Result<f64> {
        self.score_with(&self.network()?, window)
    }

    /// Scores for many windows against one decoded network
    pub fn scores(&self, windows: &[Vec<Vec<f64>>]) -> Result<Vec<f64>> {
        let network = self.network()?;
        windows.iter().map(|w| self.score_with(&network, w)).collect()
    }

    pub fn predict_with(&self, network: &SequenceNetwork<Cpu>, window: &[Vec<f64>]) -> Result<Vec<f64>> {
        self.check_window(window)?;
        let (context, _) =
            split_batch::<Cpu>(&[window], self.window_length, self.input_dim, &backend::device())?;
        backend::values(network.forward(context))
    }

    pub fn score_with(&self, network: &SequenceNetwork<Cpu>, window: &[Vec<f64>]) -> Result<f64> {
        let predicted = self.predict_with(network, window)?;
        let actual = &window[window.len() - 1];
        Ok(mse(actual, &predicted))
    }

    fn check_window(&self, window: &[Vec<f64>]) -> Result<()> {
        if window.len() != self.window_length {
            return Err(SurveillanceError::WindowLength {
                expected: self.window_length,
                got: window.len(),
            });
        }
        if let Some(bad) = window.iter().find(|s| s.len() != self.input_dim) {
            return Err(ConfigError::DimensionMismatch {
                expected: self.input_dim,
                got: bad.len(),
            }
            .into());
        }
        Ok(())
    }
}

fn mse(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>() / a.len() as f64
}
