//! minGPT-style decoder-only transformer.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Dropout, Embedding, Init, Linear, Module, VarBuilder};
use recipes_core::config::ModelConfig;
use recipes_dist::DistributedDataParallel;
use serde::{Deserialize, Serialize};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Anything that maps a `(batch, time)` index tensor to next-symbol logits.
pub trait LanguageModel {
    /// Longest context the model accepts.
    fn block_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Logits shaped `(batch, time, vocab)`.
    fn forward(&self, idx: &Tensor, train: bool) -> Result<Tensor>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    pub vocab_size: usize,
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub embd_pdrop: f32,
    pub resid_pdrop: f32,
    pub attn_pdrop: f32,
}

impl GptConfig {
    pub fn new(vocab_size: usize, block_size: usize, model: &ModelConfig) -> Self {
        Self {
            vocab_size,
            block_size,
            n_layer: model.n_layer,
            n_head: model.n_head,
            n_embd: model.n_embd,
            embd_pdrop: model.embd_pdrop,
            resid_pdrop: model.resid_pdrop,
            attn_pdrop: model.attn_pdrop,
        }
    }
}

/// Layer norm over the last dimension, written with differentiable ops.
#[derive(Debug, Clone)]
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    fn new(size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&var.affine(1.0, LAYER_NORM_EPS)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    attn_drop: Dropout,
    resid_drop: Dropout,
    n_head: usize,
    n_embd: usize,
}

impl CausalSelfAttention {
    fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_attn: candle_nn::linear(cfg.n_embd, 3 * cfg.n_embd, vb.pp("c_attn"))?,
            c_proj: candle_nn::linear(cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
            attn_drop: Dropout::new(cfg.attn_pdrop),
            resid_drop: Dropout::new(cfg.resid_pdrop),
            n_head: cfg.n_head,
            n_embd: cfg.n_embd,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let head_size = c / self.n_head;
        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i * self.n_embd, self.n_embd)?
                .reshape((b, t, self.n_head, head_size))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        let scale = 1.0 / (head_size as f64).sqrt();
        let att = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let mask = causal_mask(t, x.device())?.broadcast_as(att.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, x.device())?.broadcast_as(att.shape())?;
        let att = mask.where_cond(&neg_inf, &att)?;
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let att = self.attn_drop.forward(&att, train)?;

        let y = att.matmul(&v)?.transpose(1, 2)?.reshape((b, t, c))?;
        self.resid_drop.forward(&self.c_proj.forward(&y)?, train)
    }
}

/// `1` where position `j` lies in the future of position `i`.
fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_vec(mask, (t, t), device)
}

#[derive(Debug, Clone)]
struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    drop: Dropout,
}

impl Mlp {
    fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: candle_nn::linear(cfg.n_embd, 4 * cfg.n_embd, vb.pp("c_fc"))?,
            c_proj: candle_nn::linear(4 * cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
            drop: Dropout::new(cfg.resid_pdrop),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu()?;
        self.drop.forward(&self.c_proj.forward(&h)?, train)
    }
}

#[derive(Debug, Clone)]
struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::new(cfg.n_embd, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(cfg, vb.pp("attn"))?,
            ln_2: LayerNorm::new(cfg.n_embd, vb.pp("ln_2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, train)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?, train)?
    }
}

#[derive(Debug, Clone)]
pub struct Gpt {
    wte: Embedding,
    wpe: Embedding,
    drop: Dropout,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: GptConfig,
}

impl Gpt {
    /// Build the model, creating (or reusing) its variables through `vb`.
    pub fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(config, vb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            wte: candle_nn::embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?,
            wpe: candle_nn::embedding(config.block_size, config.n_embd, vb.pp("wpe"))?,
            drop: Dropout::new(config.embd_pdrop),
            blocks,
            ln_f: LayerNorm::new(config.n_embd, vb.pp("ln_f"))?,
            lm_head: candle_nn::linear_no_bias(config.n_embd, config.vocab_size, vb.pp("lm_head"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Mean cross-entropy of `logits` against `targets` over every position.
    pub fn loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (b, t, v) = logits.dims3()?;
        candle_nn::loss::cross_entropy(
            &logits.reshape((b * t, v))?,
            &targets.reshape(b * t)?.to_dtype(DType::U32)?,
        )
    }
}

impl LanguageModel for Gpt {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, t) = idx.dims2()?;
        if t > self.config.block_size {
            candle_core::bail!(
                "cannot forward sequence of length {t}, block size is {}",
                self.config.block_size
            );
        }
        let tok = self.wte.forward(idx)?;
        let pos = Tensor::arange(0u32, t as u32, idx.device())?;
        let pos = self.wpe.forward(&pos)?;
        let mut x = self.drop.forward(&tok.broadcast_add(&pos)?, train)?;
        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }
        self.lm_head.forward(&self.ln_f.forward(&x)?)
    }
}

impl<M: LanguageModel> LanguageModel for DistributedDataParallel<M> {
    fn block_size(&self) -> usize {
        self.module().block_size()
    }

    fn vocab_size(&self) -> usize {
        self.module().vocab_size()
    }

    fn forward(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        self.module().forward(idx, train)
    }
}
