use std::collections::HashMap;

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Linear, Module};

use crate::config::ModelConfig;
use crate::text_model::TextDecoder;
use crate::utils::{lookup_tensor, VlaError};
use crate::vision_model::VisionEncoder;

/// Fused vision-language-action model: token embedding, ViT encoder, a
/// linear modality projector and a llama-style decoder.
pub struct VlaModel {
    embed: Embedding,
    vision: VisionEncoder,
    projector: Linear,
    text: TextDecoder,
}

impl VlaModel {
    pub fn load(c: &HashMap<String, Tensor>, cfg: &ModelConfig) -> std::result::Result<Self, VlaError> {
        Ok(Self {
            embed: Embedding::new(
                lookup_tensor(c, "language_model.embed_tokens.weight")?,
                cfg.text_config.hidden_size,
            ),
            vision: VisionEncoder::load(c, &cfg.vision_config)?,
            projector: Linear::new(
                lookup_tensor(c, "projector.weight")?,
                Some(lookup_tensor(c, "projector.bias")?),
            ),
            text: TextDecoder::load(c, &cfg.text_config)?,
        })
    }

    /// Prefill pass with the projected image patches prepended to the prompt
    /// token embeddings. Returns `(logits, hidden_states)` over the fused
    /// sequence.
    pub fn forward_prefill(
        &mut self,
        input_ids: &Tensor,
        pixel_values: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let text_embeds = self.embed.forward(input_ids)?;
        let image_hidden = self.vision.forward(pixel_values)?;
        let image_embeds = self.projector.forward(&image_hidden)?.squeeze(0)?;

        let fused = Tensor::cat(&[&image_embeds, &text_embeds], 0)?;
        self.text.forward(fused, 0)
    }

    /// Decode one more token through the kv cache.
    pub fn forward_step(&mut self, token: u32, index_pos: usize) -> Result<(Tensor, Tensor)> {
        let device = self.embed.embeddings().device().clone();
        let input = Tensor::from_slice(&[token], 1, &device)?;
        let x = self.embed.forward(&input)?;
        self.text.forward(x, index_pos)
    }

    pub fn reset_cache(&mut self) -> Result<()> {
        self.text.reset_cache()
    }
}

/// Center of an action bin in the normalized `[-1, 1]` action range.
pub(crate) fn bin_center(bin: usize, num_bins: usize) -> f32 {
    let width = 2.0 / num_bins as f32;
    -1.0 + (bin as f32 + 0.5) * width
}

/// Clamp a token into the action-bin region at the vocabulary tail and
/// return its bin index.
pub(crate) fn token_to_bin(token: u32, region_start: u32, num_bins: usize) -> usize {
    let max = region_start as usize + num_bins - 1;
    (token as usize).clamp(region_start as usize, max) - region_start as usize
}
