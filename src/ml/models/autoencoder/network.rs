//! Autoencoder Network Architecture
//!
//! Symmetric dense autoencoder: the decoder mirrors the encoder widths.
//! Default architecture for the six market features:
//! 6 -> 16 -> 8 -> 3 (latent) -> 8 -> 16 -> 6

use burn::module::Module;
use burn::nn::Linear;
use burn::tensor::activation::tanh;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{check_positive, check_range};
use crate::error::{ConfigError, ModelUnavailable, Result};
use crate::ml::backend::{self, seeded_linear, Cpu, ParamIds};

/// Autoencoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    /// Hidden layer dimensions (encoder path)
    pub hidden_dims: Vec<usize>,
    /// Latent space dimension
    pub latent_dim: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Batch size for training
    pub batch_size: usize,
    /// Maximum number of training epochs
    pub epochs: usize,
    /// Epochs without improvement before stopping
    pub patience: usize,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![16, 8],
            latent_dim: 3,
            learning_rate: 0.005,
            batch_size: 32,
            epochs: 40,
            patience: 5,
        }
    }
}

impl AutoencoderConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.latent_dim == 0 || self.hidden_dims.iter().any(|&w| w == 0) {
            return Err(ConfigError::InvalidParameter {
                name: "autoencoder.hidden_dims",
                reason: "layer widths must be non-zero".to_string(),
            });
        }
        check_positive("autoencoder.learning_rate", self.learning_rate)?;
        check_range("autoencoder.batch_size", self.batch_size as f64, 1.0, 1e6)?;
        check_range("autoencoder.epochs", self.epochs as f64, 1.0, 1e6)?;
        Ok(())
    }

    /// Layer widths from input to output, e.g. [6, 16, 8, 3, 8, 16, 6]
    pub fn layer_widths(&self, input_dim: usize) -> Vec<usize> {
        let mut widths = vec![input_dim];
        widths.extend(&self.hidden_dims);
        widths.push(self.latent_dim);
        widths.extend(self.hidden_dims.iter().rev());
        widths.push(input_dim);
        widths
    }
}

/// Dense autoencoder with tanh hidden layers and a linear output
#[derive(Module, Debug)]
pub struct AutoencoderNetwork<B: Backend> {
    encoder: Vec<Linear<B>>,
    decoder: Vec<Linear<B>>,
}

impl<B: Backend> AutoencoderNetwork<B> {
    /// Create a new autoencoder with Xavier-uniform weights drawn from `rng`
    pub fn new<R: Rng>(
        input_dim: usize,
        config: &AutoencoderConfig,
        rng: &mut R,
        device: &B::Device,
    ) -> Self {
        let widths = config.layer_widths(input_dim);
        let mut ids = ParamIds::new();
        let mut encoder = Vec::with_capacity(widths.len() - 1);
        for pair in widths.windows(2) {
            encoder.push(seeded_linear(pair[0], pair[1], &mut ids, rng, device));
        }
        let decoder = encoder.split_off(encoder.len() / 2);
        Self { encoder, decoder }
    }

    /// Encode input to latent representation
    pub fn encode(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.encoder
            .iter()
            .fold(x, |h, layer| tanh(layer.forward(h)))
    }

    /// Decode latent representation to reconstruction
    pub fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.decoder.len().saturating_sub(1);
        self.decoder.iter().enumerate().fold(z, |h, (i, layer)| {
            let y = layer.forward(h);
            if i == last {
                y
            } else {
                tanh(y)
            }
        })
    }

    /// Forward pass: encode then decode
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let z = self.encode(x);
        self.decode(z)
    }

    /// Mean squared reconstruction error per row
    pub fn reconstruction_error(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let reconstructed = self.forward(x.clone());
        (x - reconstructed).powi_scalar(2).mean_dim(1).squeeze(1)
    }
}

impl AutoencoderNetwork<Cpu> {
    fn row_error(&self, row: &[f64]) -> Result<f64> {
        let x = backend::matrix::<Cpu>([row], row.len(), &backend::device())?;
        let errors = backend::values(self.reconstruction_error(x))?;
        Ok(errors.first().copied().unwrap_or(0.0))
    }
}

/// Trained autoencoder as stored in an artifact: its shape plus the burn record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autoencoder {
    input_dim: usize,
    config: AutoencoderConfig,
    record: Vec<u8>,
}

impl Autoencoder {
    pub fn from_network(
        input_dim: usize,
        config: AutoencoderConfig,
        network: AutoencoderNetwork<Cpu>,
    ) -> Result<Self> {
        Ok(Self {
            input_dim,
            config,
            record: backend::encode_module(network)?,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn latent_dim(&self) -> usize {
        self.config.latent_dim
    }

    /// Rebuild the network from the stored record
    pub fn network(&self) -> std::result::Result<AutoencoderNetwork<Cpu>, ModelUnavailable> {
        let skeleton = AutoencoderNetwork::new(
            self.input_dim,
            &self.config,
            &mut StdRng::seed_from_u64(0),
            &backend::device(),
        );
        backend::decode_module(skeleton, &self.record)
    }

    /// Mean squared reconstruction error of one standardized row
    pub fn reconstruction_error(&self, x: &[f64]) -> Result<f64> {
        self.check_dimension(x)?;
        self.network()?.row_error(x)
    }

    /// Per-row errors; each row is computed exactly as a single call would
    pub fn reconstruction_errors(&self, batch: &[Vec<f64>]) -> Result<Vec<f64>> {
        let network = self.network()?;
        batch.iter().map(|x| self.error_with(&network, x)).collect()
    }

    /// Error of one row against an already decoded network
    pub fn error_with(&self, network: &AutoencoderNetwork<Cpu>, x: &[f64]) -> Result<f64> {
        self.check_dimension(x)?;
        network.row_error(x)
    }

    fn check_dimension(&self, x: &[f64]) -> std::result::Result<(), ConfigError> {
        if x.len() != self.input_dim {
            return Err(ConfigError::DimensionMismatch {
                expected: self.input_dim,
                got: x.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SurveillanceError;

    fn untrained(seed: u64) -> Autoencoder {
        let config = AutoencoderConfig::default();
        let mut rng = StdRng::seed_from_u64(seed);
        let network = AutoencoderNetwork::<Cpu>::new(6, &config, &mut rng, &backend::device());
        Autoencoder::from_network(6, config, network).unwrap()
    }

    #[test]
    fn test_autoencoder_config_default() {
        let config = AutoencoderConfig::default();
        assert_eq!(config.layer_widths(6), vec![6, 16, 8, 3, 8, 16, 6]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_width_rejected() {
        let config = AutoencoderConfig {
            hidden_dims: vec![16, 0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shapes() {
        let device = backend::device();
        let mut rng = StdRng::seed_from_u64(1);
        let ae = AutoencoderNetwork::<Cpu>::new(6, &AutoencoderConfig::default(), &mut rng, &device);
        assert_eq!(ae.encoder.len(), 3);
        assert_eq!(ae.decoder.len(), 3);

        let (a, b) = ([0.1; 6], [0.2; 6]);
        let x = backend::matrix::<Cpu>([a.as_slice(), b.as_slice()], 6, &device).unwrap();
        assert_eq!(ae.encode(x.clone()).dims(), [2, 3]);
        assert_eq!(ae.forward(x.clone()).dims(), [2, 6]);
        assert_eq!(ae.reconstruction_error(x).dims(), [2]);
    }

    #[test]
    fn test_batch_matches_single() {
        let ae = untrained(2);
        let batch: Vec<Vec<f64>> = (0..5)
            .map(|i| (0..6).map(|j| (i * 6 + j) as f64 * 0.1 - 1.0).collect())
            .collect();

        let errors = ae.reconstruction_errors(&batch).unwrap();
        for (row, err) in batch.iter().zip(&errors) {
            assert_eq!(ae.reconstruction_error(row).unwrap(), *err);
        }
    }

    #[test]
    fn test_record_keeps_weights() {
        let config = AutoencoderConfig::default();
        let device = backend::device();
        let network =
            AutoencoderNetwork::<Cpu>::new(6, &config, &mut StdRng::seed_from_u64(4), &device);
        let row = [0.3, -0.2, 0.1, 0.5, -0.4, 0.0];
        let direct = network.row_error(&row).unwrap();

        let stored = Autoencoder::from_network(6, config, network).unwrap();
        assert_eq!(stored.reconstruction_error(&row).unwrap(), direct);
        assert_eq!(stored.latent_dim(), 3);
    }

    #[test]
    fn test_wrong_dimension() {
        let ae = untrained(3);
        assert!(matches!(
            ae.reconstruction_error(&[0.0; 5]),
            Err(SurveillanceError::Configuration(ConfigError::DimensionMismatch {
                expected: 6,
                got: 5
            }))
        ));
    }
}
