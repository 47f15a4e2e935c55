//! Checkpoint architecture description, read from the `config.json` that
//! ships next to the weights.

use serde::Deserialize;

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_eos_token_id() -> u32 {
    2
}

fn default_action_dim() -> usize {
    7
}

fn default_num_action_bins() -> usize {
    256
}

/// Text decoder hyperparameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TextConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
}

impl TextConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}

/// Vision encoder hyperparameters.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub intermediate_size: usize,
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn num_patches(&self) -> usize {
        let grid = self.image_size / self.patch_size;
        grid * grid
    }
}

/// Full architecture description of a checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub text_config: TextConfig,
    pub vision_config: VisionConfig,
    #[serde(default = "default_action_dim")]
    pub action_dim: usize,
    #[serde(default = "default_num_action_bins")]
    pub num_action_bins: usize,
}

impl ModelConfig {
    /// First vocab id of the action-bin region at the tail of the vocabulary.
    pub fn action_region_start(&self) -> u32 {
        (self.text_config.vocab_size - self.num_action_bins) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_JSON: &str = r#"{
        "model_type": "openvla",
        "text_config": {
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "intermediate_size": 11008,
            "vocab_size": 32064,
            "rope_theta": 10000.0,
            "max_position_embeddings": 2048,
            "eos_token_id": 2
        },
        "vision_config": {
            "image_size": 224,
            "patch_size": 14,
            "hidden_size": 1024,
            "num_hidden_layers": 24,
            "num_attention_heads": 16,
            "intermediate_size": 4096
        },
        "action_dim": 7,
        "num_action_bins": 256
    }"#;

    #[test]
    fn parse_full_config() {
        let config: ModelConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        assert_eq!(config.text_config.hidden_size, 4096);
        assert_eq!(config.vision_config.num_patches(), 256);
        assert_eq!(config.action_dim, 7);
        assert_eq!(config.action_region_start(), 32064 - 256);
    }

    #[test]
    fn head_dim_falls_back_to_hidden_over_heads() {
        let config: ModelConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        assert_eq!(config.text_config.head_dim(), 128);
        assert_eq!(config.vision_config.head_dim(), 64);
    }

    #[test]
    fn optional_fields_take_defaults() {
        let json = r#"{
            "text_config": {
                "hidden_size": 64,
                "num_hidden_layers": 2,
                "num_attention_heads": 4,
                "intermediate_size": 128,
                "vocab_size": 512
            },
            "vision_config": {
                "image_size": 28,
                "patch_size": 14,
                "hidden_size": 32,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "intermediate_size": 64
            }
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.text_config.rope_theta, 10_000.0);
        assert_eq!(config.text_config.max_position_embeddings, 4096);
        assert_eq!(config.text_config.eos_token_id, 2);
        assert_eq!(config.action_dim, 7);
        assert_eq!(config.num_action_bins, 256);
    }
}
