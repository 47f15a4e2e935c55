//! Input processing for OpenVLA checkpoints.
//!
//! Converts a (prompt, image) pair into model-ready tensors on the target
//! device and dtype, and decodes generated token ids back to text.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use kornia_image::{
    allocator::{CpuAllocator, ImageAllocator},
    Image,
};
use kornia_imgproc::{interpolation::InterpolationMode, resize::resize_fast};
use tokenizers::Tokenizer;

use crate::utils::VlaError;

// ImageNet statistics, matching the visual backbone's training normalization.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Tensor inputs for one action prediction.
pub struct VlaInputs {
    /// Prompt token ids with shape `[seq_len]`.
    pub input_ids: Tensor,
    /// Normalized image with shape `[1, 3, size, size]`.
    pub pixel_values: Tensor,
}

/// Converts raw (prompt, image) pairs into model inputs and decodes token
/// ids, paired with the model loaded from the same checkpoint directory.
pub struct OpenVlaProcessor {
    tokenizer: Tokenizer,
    img_buf: Image<u8, 3, CpuAllocator>,
    mean: Tensor,
    std: Tensor,
    device: Device,
    dtype: DType,
}

impl OpenVlaProcessor {
    /// Load the processor for the checkpoint at `model_path`.
    ///
    /// # Arguments
    ///
    /// * `model_path` - Checkpoint directory containing `tokenizer.json`
    /// * `image_size` - Side length the visual backbone expects
    /// * `device` - Device the produced tensors live on
    /// * `dtype` - Dtype of the produced pixel tensor
    pub fn from_pretrained(
        model_path: &Path,
        image_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, VlaError> {
        let tokenizer_path = model_path.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(VlaError::CheckpointFileNotFound(
                tokenizer_path.display().to_string(),
            ));
        }

        Ok(Self {
            tokenizer: Tokenizer::from_file(&tokenizer_path)?,
            img_buf: Image::from_size_val([image_size, image_size].into(), 0, CpuAllocator)?,
            mean: Tensor::from_slice(&MEAN, (3, 1, 1), device)?,
            std: Tensor::from_slice(&STD, (3, 1, 1), device)?,
            device: device.clone(),
            dtype,
        })
    }

    /// Turn a prompt and an rgb8 image into model-ready tensors.
    ///
    /// The image is resized to the backbone's input size, rescaled to
    /// `[0, 1]` and normalized channel-wise before the batch dimension is
    /// added.
    pub fn process<A: ImageAllocator>(
        &mut self,
        prompt: &str,
        image: &Image<u8, 3, A>,
    ) -> Result<VlaInputs, VlaError> {
        resize_fast(image, &mut self.img_buf, InterpolationMode::Bilinear)?;

        let pixel_values = Tensor::from_raw_buffer(
            self.img_buf.as_slice(),
            DType::U8,
            &[self.img_buf.rows(), self.img_buf.cols(), 3],
            &self.device,
        )?
        .to_dtype(DType::F32)?
        .permute((2, 0, 1))?
        .affine(1.0 / 255.0, 0.0)?
        .broadcast_sub(&self.mean)?
        .broadcast_div(&self.std)?
        .to_dtype(self.dtype)?
        .unsqueeze(0)?;

        let encoding = self.tokenizer.encode(prompt, true)?;
        let ids = encoding.get_ids();
        let input_ids = Tensor::from_slice(ids, ids.len(), &self.device)?;

        Ok(VlaInputs {
            input_ids,
            pixel_values,
        })
    }

    /// Decode generated token ids back to text.
    pub fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String, VlaError> {
        Ok(self.tokenizer.decode(token_ids, skip_special_tokens)?)
    }
}
