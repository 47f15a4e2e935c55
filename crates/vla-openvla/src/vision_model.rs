use std::collections::HashMap;

use candle_core::{DType, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, Module};

use crate::config::VisionConfig;
use crate::utils::{lookup_tensor, VlaError};

const LN_EPS: f64 = 1e-6;

type LoadResult<T> = std::result::Result<T, VlaError>;

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batches, patches, hidden_size) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((batches, patches, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batches, patches, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batches, patches, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.contiguous()?.to_dtype(in_dtype)?
        };

        let y = y
            .transpose(1, 2)?
            .reshape(&[batches, patches, hidden_size])?;
        self.out_proj.forward(&y)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // tanh-approximated gelu, matching the backbone
        let x = self.fc1.forward(x)?.gelu()?;
        self.fc2.forward(&x)
    }
}

struct Block {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(c: &HashMap<String, Tensor>, cfg: &VisionConfig, id: usize) -> LoadResult<Self> {
        let w = |k: &str| lookup_tensor(c, &format!("vision_model.layers.{id}.{k}.weight"));
        let b = |k: &str| lookup_tensor(c, &format!("vision_model.layers.{id}.{k}.bias"));

        Ok(Self {
            layer_norm1: LayerNorm::new(w("layer_norm1")?, b("layer_norm1")?, LN_EPS),
            self_attn: Attention {
                q_proj: Linear::new(w("self_attn.q_proj")?, Some(b("self_attn.q_proj")?)),
                k_proj: Linear::new(w("self_attn.k_proj")?, Some(b("self_attn.k_proj")?)),
                v_proj: Linear::new(w("self_attn.v_proj")?, Some(b("self_attn.v_proj")?)),
                out_proj: Linear::new(w("self_attn.out_proj")?, Some(b("self_attn.out_proj")?)),
                num_heads: cfg.num_attention_heads,
                head_dim: cfg.head_dim(),
            },
            layer_norm2: LayerNorm::new(w("layer_norm2")?, b("layer_norm2")?, LN_EPS),
            mlp: Mlp {
                fc1: Linear::new(w("mlp.fc1")?, Some(b("mlp.fc1")?)),
                fc2: Linear::new(w("mlp.fc2")?, Some(b("mlp.fc2")?)),
            },
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let x = self.layer_norm1.forward(x)?;
        let x = self.self_attn.forward(&x)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.layer_norm2.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }
}

/// ViT image encoder.
pub struct VisionEncoder {
    patch_embedding: Conv2d,
    position_embedding: Embedding,
    position_ids: Tensor,
    blocks: Vec<Block>,
    post_layernorm: LayerNorm,
}

impl VisionEncoder {
    pub fn load(c: &HashMap<String, Tensor>, cfg: &VisionConfig) -> LoadResult<Self> {
        let patch_weight = lookup_tensor(c, "vision_model.patch_embedding.weight")?;
        let device = patch_weight.device().clone();

        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };

        Ok(Self {
            patch_embedding: Conv2d::new(
                patch_weight,
                Some(lookup_tensor(c, "vision_model.patch_embedding.bias")?),
                conv_cfg,
            ),
            position_embedding: Embedding::new(
                lookup_tensor(c, "vision_model.position_embedding.weight")?,
                cfg.hidden_size,
            ),
            position_ids: Tensor::arange(0, cfg.num_patches() as u32, &device)?,
            blocks: (0..cfg.num_hidden_layers)
                .map(|i| Block::load(c, cfg, i))
                .collect::<LoadResult<_>>()?,
            post_layernorm: LayerNorm::new(
                lookup_tensor(c, "vision_model.post_layernorm.weight")?,
                lookup_tensor(c, "vision_model.post_layernorm.bias")?,
                LN_EPS,
            ),
        })
    }

    /// Encode `[batch, 3, size, size]` pixels into `[batch, patches, hidden]`
    /// patch embeddings.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = self.patch_embedding.forward(pixel_values)?;
        let x = x.flatten(2, 3)?.transpose(1, 2)?.contiguous()?;

        let pos = self.position_embedding.forward(&self.position_ids)?;
        let mut x = x.broadcast_add(&pos)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.post_layernorm.forward(&x)
    }
}
