use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{rotary_emb::rope, Linear, Module, RmsNorm};

use crate::config::TextConfig;
use crate::utils::{lookup_tensor, VlaError};

const RMS_EPS: f64 = 1e-5;

type LoadResult<T> = std::result::Result<T, VlaError>;

/// SiLU computed in f32 for numeric parity with the reference checkpoints.
fn silu(x: &Tensor) -> Result<Tensor> {
    let original_dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let sigmoid = (x.neg()?.exp()? + 1.0)?.recip()?;
    (x * sigmoid)?.to_dtype(original_dtype)
}

fn inv_frequencies(head_dim: usize, rope_theta: f32) -> Vec<f32> {
    (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / rope_theta.powf(i as f32 / head_dim as f32))
        .collect()
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,

    // rotary tables and the kv cache
    cos: Tensor,
    sin: Tensor,
    k_cache: Tensor,
    v_cache: Tensor,

    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(q: Tensor, k: Tensor, v: Tensor, o: Tensor, cfg: &TextConfig) -> Result<Self> {
        let device = q.device().clone();
        let dtype = q.dtype();
        let (num_heads, head_dim) = (cfg.num_attention_heads, cfg.head_dim());

        let theta = Tensor::new(inv_frequencies(head_dim, cfg.rope_theta), &device)?;
        let idx_theta = Tensor::arange(0, cfg.max_position_embeddings as u32, &device)?
            .to_dtype(DType::F32)?
            .reshape((cfg.max_position_embeddings, 1))?
            .matmul(&theta.reshape((1, theta.elem_count()))?)?;

        Ok(Self {
            cos: idx_theta.cos()?.to_dtype(dtype)?,
            sin: idx_theta.sin()?.to_dtype(dtype)?,
            k_cache: Tensor::zeros((num_heads, 0, head_dim), dtype, &device)?,
            v_cache: Tensor::zeros((num_heads, 0, head_dim), dtype, &device)?,
            q_proj: Linear::new(q, None),
            k_proj: Linear::new(k, None),
            v_proj: Linear::new(v, None),
            o_proj: Linear::new(o, None),
            num_heads,
            head_dim,
        })
    }

    fn apply_rotary_embedding(&self, x: &Tensor, index_pos: usize) -> Result<Tensor> {
        let (_heads, seq_len, _head_dim) = x.dims3()?;

        rope(
            &x.unsqueeze(0)?,
            &self.cos.narrow(0, index_pos, seq_len)?,
            &self.sin.narrow(0, index_pos, seq_len)?,
        )?
        .squeeze(0)
    }

    fn forward(&mut self, x: &Tensor, index_pos: usize) -> Result<Tensor> {
        let device = x.device().clone();
        let (seq_len, hidden_size) = x.dims2()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((seq_len, self.num_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let k = k
            .reshape((seq_len, self.num_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let v = v
            .reshape((seq_len, self.num_heads, self.head_dim))?
            .transpose(0, 1)?;

        let q = self.apply_rotary_embedding(&q, index_pos)?;
        let k = self.apply_rotary_embedding(&k, index_pos)?;

        // new tokens always extend the cached sequence
        self.k_cache = Tensor::cat(&[&self.k_cache, &k], 1)?;
        self.v_cache = Tensor::cat(&[&self.v_cache, &v], 1)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = self.k_cache.to_dtype(DType::F32)?;
            let v = self.v_cache.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = if seq_len == 1 {
                att
            } else {
                let mask = Self::causal_mask(seq_len, self.k_cache.dims()[1], &device)?;
                att.broadcast_add(&mask)?
            };
            let att = candle_nn::ops::softmax_last_dim(&att)?;

            att.matmul(&v)?.contiguous()?.to_dtype(in_dtype)?
        };

        let y = y.transpose(0, 1)?.reshape(&[seq_len, hidden_size])?;
        self.o_proj.forward(&y)
    }

    fn causal_mask(seq_len: usize, total_len: usize, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = ((total_len - seq_len)..total_len)
            .flat_map(|i| (0..total_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Tensor::from_vec(mask, (seq_len, total_len), device)
    }

    fn reset_cache(&mut self) -> Result<()> {
        let dtype = self.k_cache.dtype();
        let device = self.k_cache.device().clone();
        self.k_cache = Tensor::zeros((self.num_heads, 0, self.head_dim), dtype, &device)?;
        self.v_cache = Tensor::zeros((self.num_heads, 0, self.head_dim), dtype, &device)?;
        Ok(())
    }
}

struct MlpGates {
    down_proj: Linear,
    gate_proj: Linear,
    up_proj: Linear,
}

impl MlpGates {
    fn new(d: Tensor, g: Tensor, u: Tensor) -> Self {
        Self {
            down_proj: Linear::new(d, None),
            gate_proj: Linear::new(g, None),
            up_proj: Linear::new(u, None),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

struct Block {
    input_layernorm: RmsNorm,
    attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: MlpGates,
}

impl Block {
    fn load(c: &HashMap<String, Tensor>, cfg: &TextConfig, id: usize) -> LoadResult<Self> {
        let val = |k: &str| lookup_tensor(c, &format!("language_model.layers.{id}.{k}.weight"));

        Ok(Self {
            input_layernorm: RmsNorm::new(val("input_layernorm")?, RMS_EPS),
            attn: Attention::new(
                val("self_attn.q_proj")?,
                val("self_attn.k_proj")?,
                val("self_attn.v_proj")?,
                val("self_attn.o_proj")?,
                cfg,
            )?,
            post_attention_layernorm: RmsNorm::new(val("post_attention_layernorm")?, RMS_EPS),
            mlp: MlpGates::new(
                val("mlp.down_proj")?,
                val("mlp.gate_proj")?,
                val("mlp.up_proj")?,
            ),
        })
    }

    fn forward(&mut self, x: &Tensor, index_pos: usize) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = (residual + self.attn.forward(&x, index_pos)?)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }

    fn reset_cache(&mut self) -> Result<()> {
        self.attn.reset_cache()
    }
}

/// Llama-style decoder with a per-layer kv cache.
pub struct TextDecoder {
    blocks: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
}

impl TextDecoder {
    pub fn load(c: &HashMap<String, Tensor>, cfg: &TextConfig) -> LoadResult<Self> {
        Ok(Self {
            blocks: (0..cfg.num_hidden_layers)
                .map(|i| Block::load(c, cfg, i))
                .collect::<LoadResult<_>>()?,
            norm: RmsNorm::new(lookup_tensor(c, "language_model.norm.weight")?, RMS_EPS),
            lm_head: Linear::new(lookup_tensor(c, "lm_head.weight")?, None),
        })
    }

    /// Run the decoder over `[seq_len, hidden]` embeddings starting at
    /// `index_pos`, returning `(logits, hidden_states)` with logits in f32.
    pub fn forward(&mut self, mut x: Tensor, index_pos: usize) -> Result<(Tensor, Tensor)> {
        for block in &mut self.blocks {
            x = block.forward(&x, index_pos)?;
        }
        let hidden = self.norm.forward(&x)?;
        let logits = self.lm_head.forward(&hidden)?.to_dtype(DType::F32)?;
        Ok((logits, hidden))
    }

    pub fn reset_cache(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            block.reset_cache()?;
        }
        Ok(())
    }
}
