use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

/// Errors surfaced while loading or running an OpenVLA checkpoint.
#[derive(thiserror::Error, Debug)]
pub enum VlaError {
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    ImageError(#[from] kornia_image::ImageError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    #[error("model path is not a directory: {0}")]
    ModelPathNotFound(String),

    #[error("checkpoint file not found: {0}")]
    CheckpointFileNotFound(String),

    #[error("missing tensor in checkpoint: {0}")]
    MissingTensor(String),

    #[error("invalid logits detected: {0}")]
    InvalidLogits(String),
}

/// Sampling configuration for chain-of-thought generation.
#[derive(Clone, Copy)]
pub struct OpenVlaConfig {
    pub seed: u64,
    pub temp: f64,
    pub top_p: f64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub do_sample: bool,
}

impl Default for OpenVlaConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            temp: 0.7,
            top_p: 0.9,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            do_sample: true,
        }
    }
}

/// Select the accelerated device and the reduced-precision dtype that goes
/// with it, falling back to CPU/F32 when CUDA is unavailable.
pub fn select_device_and_dtype() -> (Device, DType) {
    #[cfg(feature = "cuda")]
    let (device, dtype) = match Device::cuda_if_available(0) {
        Ok(device) => (device, DType::BF16),
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e:?}");
            (Device::Cpu, DType::F32)
        }
    };

    #[cfg(not(feature = "cuda"))]
    let (device, dtype) = (Device::Cpu, DType::F32);

    (device, dtype)
}

pub(crate) fn lookup_tensor(
    tensors: &HashMap<String, Tensor>,
    name: &str,
) -> Result<Tensor, VlaError> {
    tensors
        .get(name)
        .cloned()
        .ok_or_else(|| VlaError::MissingTensor(name.to_string()))
}
