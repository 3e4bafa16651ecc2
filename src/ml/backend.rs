//! Tensor backend for the trainable detectors
//!
//! Networks train on `Autodiff<NdArray>` and score on plain `NdArray`.
//! Weights are drawn from the caller's seeded RNG and parameters get
//! sequential ids, so two runs with the same seed produce identical records.

use std::any::Any;
use std::cell::RefCell;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, Param, ParamId};
use burn::nn::{BiLstm, GateController, Linear, Lstm};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;

use crate::error::{ConfigError, ModelUnavailable, Result, SurveillanceError};

/// Inference backend
pub type Cpu = NdArray<f32>;

/// Training backend
pub type CpuAutodiff = Autodiff<Cpu>;

type ModuleRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Decoded networks kept per scoring thread
const DECODED_CAPACITY: usize = 4;

thread_local! {
    static DECODED: RefCell<Vec<(String, Box<dyn Any>)>> = const { RefCell::new(Vec::new()) };
}

pub fn device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// Sequential parameter ids for one network
#[derive(Debug)]
pub struct ParamIds(u64);

impl ParamIds {
    pub fn new() -> Self {
        Self(1)
    }

    fn next(&mut self) -> ParamId {
        let id = ParamId::from(self.0);
        self.0 += 1;
        id
    }
}

impl Default for ParamIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense layer with Xavier-uniform weights and zero bias
pub fn seeded_linear<B: Backend, R: Rng>(
    d_input: usize,
    d_output: usize,
    ids: &mut ParamIds,
    rng: &mut R,
    device: &B::Device,
) -> Linear<B> {
    let limit = (6.0 / (d_input + d_output) as f64).sqrt();
    let weights: Vec<f32> = (0..d_input * d_output)
        .map(|_| rng.random_range(-limit..limit) as f32)
        .collect();
    let weight = Tensor::<B, 2>::from_data(TensorData::new(weights, [d_input, d_output]), device);
    let bias = Tensor::<B, 1>::zeros([d_output], device);

    Linear {
        weight: Param::initialized(ids.next(), weight.require_grad()),
        bias: Some(Param::initialized(ids.next(), bias.require_grad())),
    }
}

fn seeded_gate<B: Backend, R: Rng>(
    d_input: usize,
    d_hidden: usize,
    ids: &mut ParamIds,
    rng: &mut R,
    device: &B::Device,
) -> GateController<B> {
    GateController {
        input_transform: seeded_linear(d_input, d_hidden, ids, rng, device),
        hidden_transform: seeded_linear(d_hidden, d_hidden, ids, rng, device),
    }
}

fn seeded_lstm<B: Backend, R: Rng>(
    d_input: usize,
    d_hidden: usize,
    ids: &mut ParamIds,
    rng: &mut R,
    device: &B::Device,
) -> Lstm<B> {
    Lstm {
        input_gate: seeded_gate(d_input, d_hidden, ids, rng, device),
        forget_gate: seeded_gate(d_input, d_hidden, ids, rng, device),
        output_gate: seeded_gate(d_input, d_hidden, ids, rng, device),
        cell_gate: seeded_gate(d_input, d_hidden, ids, rng, device),
        d_hidden,
    }
}

/// Forward and reverse LSTMs over the same input
pub fn seeded_bilstm<B: Backend, R: Rng>(
    d_input: usize,
    d_hidden: usize,
    ids: &mut ParamIds,
    rng: &mut R,
    device: &B::Device,
) -> BiLstm<B> {
    BiLstm {
        forward: seeded_lstm(d_input, d_hidden, ids, rng, device),
        reverse: seeded_lstm(d_input, d_hidden, ids, rng, device),
        d_hidden,
    }
}

/// Stack equal-width rows into a `[rows, width]` tensor
pub fn matrix<'a, B: Backend>(
    rows: impl IntoIterator<Item = &'a [f64]>,
    width: usize,
    device: &B::Device,
) -> std::result::Result<Tensor<B, 2>, ConfigError> {
    let mut data = Vec::new();
    let mut count = 0;
    for row in rows {
        if row.len() != width {
            return Err(ConfigError::DimensionMismatch {
                expected: width,
                got: row.len(),
            });
        }
        data.extend(row.iter().map(|&v| v as f32));
        count += 1;
    }
    Ok(Tensor::from_data(TensorData::new(data, [count, width]), device))
}

/// Flatten a tensor back into `f64` values
pub fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f64>> {
    tensor
        .into_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .map(|v| v.into_iter().map(f64::from).collect())
        .map_err(|e| SurveillanceError::Serialization(format!("tensor readback: {e:?}")))
}

/// Serialize a network's parameters
pub fn encode_module<M: Module<Cpu>>(module: M) -> Result<Vec<u8>> {
    <ModuleRecorder as Recorder<Cpu>>::record(&ModuleRecorder::default(), module.into_record(), ())
        .map_err(|e| SurveillanceError::Serialization(e.to_string()))
}

/// Load serialized parameters into a network of the same shape
pub fn decode_module<M: Module<Cpu>>(
    skeleton: M,
    bytes: &[u8],
) -> std::result::Result<M, ModelUnavailable> {
    let record = <ModuleRecorder as Recorder<Cpu>>::load(
        &ModuleRecorder::default(),
        bytes.to_vec(),
        &device(),
    )
    .map_err(|e| ModelUnavailable::Undecodable(e.to_string()))?;
    Ok(skeleton.load_record(record))
}

/// Decoded network for `key`, decoding at most once per thread.
///
/// Networks are not `Sync`, so each scoring thread keeps its own copies.
/// The returned clone shares tensor storage with the cached one.
pub fn cached_module<M, F>(key: &str, decode: F) -> Result<M>
where
    M: Module<Cpu> + 'static,
    F: FnOnce() -> Result<M>,
{
    let hit = DECODED.with(|cell| {
        cell.borrow()
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, m)| m.downcast_ref::<M>())
            .cloned()
    });
    if let Some(module) = hit {
        return Ok(module);
    }

    let module = decode()?;
    DECODED.with(|cell| {
        let mut cache = cell.borrow_mut();
        cache.retain(|(k, _)| k != key);
        if cache.len() >= DECODED_CAPACITY {
            cache.remove(0);
        }
        cache.push((key.to_string(), Box::new(module.clone())));
    });
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn linear(seed: u64) -> Linear<Cpu> {
        let mut rng = StdRng::seed_from_u64(seed);
        seeded_linear(4, 3, &mut ParamIds::new(), &mut rng, &device())
    }

    #[test]
    fn test_seeded_linear_is_reproducible() {
        let a = encode_module(linear(5)).unwrap();
        let b = encode_module(linear(5)).unwrap();
        let c = encode_module(linear(6)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_module_bytes_round_trip() {
        let original = linear(1);
        let bytes = encode_module(original.clone()).unwrap();
        let restored = decode_module(linear(2), &bytes).unwrap();

        let x = matrix::<Cpu>([[0.5, -1.0, 2.0, 0.0].as_slice()], 4, &device()).unwrap();
        assert_eq!(
            values(original.forward(x.clone())).unwrap(),
            values(restored.forward(x)).unwrap()
        );
    }

    #[test]
    fn test_garbage_bytes_are_undecodable() {
        assert!(matches!(
            decode_module(linear(1), b"not a record"),
            Err(ModelUnavailable::Undecodable(_))
        ));
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        let rows = [vec![1.0, 2.0], vec![3.0]];
        assert_eq!(
            matrix::<Cpu>(rows.iter().map(|r| r.as_slice()), 2, &device()).unwrap_err(),
            ConfigError::DimensionMismatch { expected: 2, got: 1 }
        );
    }

    #[test]
    fn test_cached_module_decodes_once() {
        let mut decodes = 0;
        for _ in 0..3 {
            let _: Linear<Cpu> = cached_module("backend-test-key", || {
                decodes += 1;
                Ok(linear(3))
            })
            .unwrap();
        }
        assert_eq!(decodes, 1);
    }
}
