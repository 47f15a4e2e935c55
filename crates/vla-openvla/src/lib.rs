//! # OpenVLA inference
//!
//! High-level interface for running OpenVLA-style vision-language-action
//! checkpoints: given a camera image and a language instruction, the model
//! predicts a normalized robot action, optionally preceded by a generated
//! chain-of-thought token sequence.
//!
//! A checkpoint is a local directory holding `config.json`,
//! `tokenizer.json` and `model.safetensors`. Execution is inference-only;
//! candle builds no autograd graph, so no gradient scope management is
//! needed around the prediction calls.

/// Checkpoint architecture description (`config.json`).
pub mod config;

/// Input processing: (prompt, image) pairs to tensors, token ids to text.
pub mod preprocessor;

/// Prompt templates for action prediction.
pub mod prompt;

/// Shared error and configuration types.
pub mod utils;

mod model;
mod text_model;
mod vision_model;

pub use config::{ModelConfig, TextConfig, VisionConfig};
pub use preprocessor::{OpenVlaProcessor, VlaInputs};
pub use prompt::build_prompt;
pub use utils::{select_device_and_dtype, OpenVlaConfig, VlaError};

use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use log::debug;

use crate::model::{bin_center, token_to_bin, VlaModel};

/// An OpenVLA-style model loaded from a local checkpoint directory.
pub struct OpenVla {
    model: VlaModel,
    arch: ModelConfig,
    config: OpenVlaConfig,
    logits_processor: LogitsProcessor,
    device: Device,
    dtype: DType,
}

impl OpenVla {
    /// Load a checkpoint directory onto the accelerated device.
    ///
    /// # Arguments
    ///
    /// * `model_path` - Directory holding `config.json`, `tokenizer.json`
    ///   and `model.safetensors`
    /// * `config` - Sampling configuration for chain-of-thought generation
    ///
    /// # Returns
    pub fn from_pretrained(
        model_path: impl AsRef<Path>,
        config: OpenVlaConfig,
    ) -> Result<Self, VlaError> {
        let model_path = model_path.as_ref();
        if !model_path.is_dir() {
            return Err(VlaError::ModelPathNotFound(
                model_path.display().to_string(),
            ));
        }

        let (device, dtype) = select_device_and_dtype();
        debug!(
            "loading checkpoint from {} on {device:?} as {dtype:?}",
            model_path.display()
        );

        let arch: ModelConfig =
            serde_json::from_reader(File::open(checkpoint_file(model_path, "config.json")?)?)?;

        let mut weights =
            candle_core::safetensors::load(checkpoint_file(model_path, "model.safetensors")?, &device)?;
        for value in weights.values_mut() {
            if value.dtype() != dtype {
                *value = value.to_dtype(dtype)?;
            }
        }

        let model = VlaModel::load(&weights, &arch)?;

        Ok(Self {
            model,
            logits_processor: build_logits_processor(&config),
            arch,
            config,
            device,
            dtype,
        })
    }

    /// Build the input processor paired with this model.
    pub fn processor(&self, model_path: impl AsRef<Path>) -> Result<OpenVlaProcessor, VlaError> {
        OpenVlaProcessor::from_pretrained(
            model_path.as_ref(),
            self.arch.vision_config.image_size,
            &self.device,
            self.dtype,
        )
    }

    /// Update the sampling configuration.
    pub fn update_config(&mut self, config: OpenVlaConfig) {
        self.config = config;
        self.logits_processor = build_logits_processor(&config);
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn arch(&self) -> &ModelConfig {
        &self.arch
    }

    /// Predict an action without chain-of-thought generation.
    ///
    /// The action tokens are decoded greedily straight after the prefill
    /// pass.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Processor output for one (prompt, image) pair
    ///
    /// # Returns
    ///
    /// The `[action_dim]` action tensor with values in `[-1, 1]`, and the
    /// final-layer hidden states of the prefill pass.
    pub fn predict_action(
        &mut self,
        inputs: &VlaInputs,
    ) -> Result<(Tensor, Option<Tensor>), VlaError> {
        self.model.reset_cache()?;

        let (logits, hidden) = self
            .model
            .forward_prefill(&inputs.input_ids, &inputs.pixel_values)?;
        let seq_len = logits.dims2()?.0;
        let last_logits = logits.i((seq_len - 1, ..))?;

        let (actions, _) = self.decode_action(last_logits, seq_len)?;

        Ok((actions, Some(hidden)))
    }

    /// Predict an action preceded by a chain-of-thought token sequence.
    ///
    /// Up to `max_cot_tokens` tokens are sampled before the action tokens;
    /// generation stops early at the end-of-sequence token or at the first
    /// token falling into the action-bin region. When no token is generated
    /// the third element is `None` and the call still succeeds.
    pub fn predict_action_with_cot(
        &mut self,
        inputs: &VlaInputs,
        max_cot_tokens: usize,
    ) -> Result<(Tensor, Option<Tensor>, Option<Vec<u32>>), VlaError> {
        self.model.reset_cache()?;

        let (logits, hidden) = self
            .model
            .forward_prefill(&inputs.input_ids, &inputs.pixel_values)?;
        let seq_len = logits.dims2()?.0;
        let mut index_pos = seq_len;
        let mut last_logits = logits.i((seq_len - 1, ..))?;

        let region_start = self.arch.action_region_start();
        let eos_token = self.arch.text_config.eos_token_id;
        let mut cot_tokens: Vec<u32> = Vec::new();

        for _ in 0..max_cot_tokens {
            let sampling_logits = if self.config.repeat_penalty == 1.0 || cot_tokens.is_empty() {
                last_logits.clone()
            } else {
                let start_at = cot_tokens.len().saturating_sub(self.config.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &last_logits,
                    self.config.repeat_penalty,
                    &cot_tokens[start_at..],
                )?
            };

            let token = self.logits_processor.sample(&sampling_logits)?;
            if token == eos_token || token >= region_start {
                break;
            }

            cot_tokens.push(token);
            let (logits, _) = self.model.forward_step(token, index_pos)?;
            index_pos += 1;
            last_logits = logits.i((0, ..))?;
        }

        debug!("generated {} chain-of-thought tokens", cot_tokens.len());

        let (actions, _) = self.decode_action(last_logits, index_pos)?;

        let cot_tokens = if cot_tokens.is_empty() {
            None
        } else {
            Some(cot_tokens)
        };

        Ok((actions, Some(hidden), cot_tokens))
    }

    /// Greedily decode `action_dim` tokens and map them to bin centers.
    fn decode_action(
        &mut self,
        mut last_logits: Tensor,
        mut index_pos: usize,
    ) -> Result<(Tensor, usize), VlaError> {
        let region_start = self.arch.action_region_start();
        let num_bins = self.arch.num_action_bins;

        let mut values = Vec::with_capacity(self.arch.action_dim);
        for step in 0..self.arch.action_dim {
            let token = argmax_token(&last_logits)?;
            let bin = token_to_bin(token, region_start, num_bins);
            values.push(bin_center(bin, num_bins));

            if step + 1 < self.arch.action_dim {
                let (logits, _) = self.model.forward_step(region_start + bin as u32, index_pos)?;
                index_pos += 1;
                last_logits = logits.i((0, ..))?;
            }
        }

        let actions = Tensor::from_vec(values, self.arch.action_dim, &self.device)?;
        Ok((actions, index_pos))
    }
}

/// Argmax with a deterministic tiebreaker, skipping non-finite logits.
fn argmax_token(logits: &Tensor) -> Result<u32, VlaError> {
    let logits = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;

    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        match best {
            Some((_, best_v)) if v <= best_v => {}
            _ => best = Some((i, v)),
        }
    }

    let (token, _) = best.ok_or_else(|| {
        VlaError::InvalidLogits("no finite logits found, all values may be NaN".to_string())
    })?;

    Ok(token as u32)
}

fn build_logits_processor(config: &OpenVlaConfig) -> LogitsProcessor {
    if config.do_sample {
        LogitsProcessor::new(config.seed, Some(config.temp), Some(config.top_p))
    } else {
        LogitsProcessor::from_sampling(config.seed, Sampling::ArgMax)
    }
}

fn checkpoint_file(model_path: &Path, name: &str) -> Result<PathBuf, VlaError> {
    let path = model_path.join(name);
    if !path.exists() {
        return Err(VlaError::CheckpointFileNotFound(
            path.display().to_string(),
        ));
    }
    Ok(path)
}
