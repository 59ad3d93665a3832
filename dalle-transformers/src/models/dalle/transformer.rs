//! Causal transformer shared by the text and image tokens.
//!
//! Each layer is a pre-norm attention branch followed by a pre-norm GEGLU feed-forward
//! branch, both outputs being scaled by a learned per-channel factor before the residual
//! add. Keys and values are cached so that sampling feeds a single token per step.
use super::DalleConfig;
use crate::models::with_tracing::{linear, linear_no_bias, Linear};
use crate::utils::{causal_mask, masked_fill};
use candle::{Module, Result, Tensor, D};
use candle_nn::{layer_norm, LayerNorm, VarBuilder};

const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone)]
struct Attention {
    to_qkv: Linear,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
    scale: f64,
    kv_cache: Option<(Tensor, Tensor)>,
    span: tracing::Span,
}

impl Attention {
    fn new(dim: usize, heads: usize, dim_head: usize, vb: VarBuilder) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let to_qkv = linear_no_bias(dim, inner_dim * 3, vb.pp("to_qkv"))?;
        let to_out = linear(inner_dim, dim, vb.pp("to_out.0"))?;
        let span = tracing::span!(tracing::Level::TRACE, "attn");
        Ok(Self {
            to_qkv,
            to_out,
            heads,
            dim_head,
            scale: 1. / (dim_head as f64).sqrt(),
            kv_cache: None,
            span,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, n, _) = xs.dims3()?;
        let qkv = self
            .to_qkv
            .forward(xs)?
            .reshape((b, n, 3, self.heads, self.dim_head))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.get(0)? * self.scale)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;
        let (k, v) = match &self.kv_cache {
            None => (k, v),
            Some((prev_k, prev_v)) => {
                let k = Tensor::cat(&[prev_k, &k], 2)?.contiguous()?;
                let v = Tensor::cat(&[prev_v, &v], 2)?.contiguous()?;
                (k, v)
            }
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let dots = q.matmul(&k.t()?)?;
        let dots = match mask {
            None => dots,
            Some(mask) => {
                let mask = mask.broadcast_as(dots.shape())?;
                masked_fill(&dots, &mask, f32::NEG_INFINITY)?
            }
        };
        let attn = candle_nn::ops::softmax_last_dim(&dots)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, self.heads * self.dim_head))?;
        self.to_out.forward(&out)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let proj_in = linear(dim, dim * mult * 2, vb.pp("net.0"))?;
        let proj_out = linear(dim * mult, dim, vb.pp("net.3"))?;
        Ok(Self { proj_in, proj_out })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.proj_in.forward(xs)?;
        let chunks = xs.chunk(2, D::Minus1)?;
        let gated = (&chunks[0] * chunks[1].gelu_erf()?)?;
        self.proj_out.forward(&gated)
    }
}

/// Norm in front of a branch, and optionally behind it, followed by the layer scale.
#[derive(Debug, Clone)]
struct ScaledPreNorm {
    scale: Tensor,
    norm: LayerNorm,
    norm_out: Option<LayerNorm>,
}

impl ScaledPreNorm {
    fn new(dim: usize, sandwich: bool, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get((1, 1, dim), "scale")?;
        let norm = layer_norm(dim, LAYER_NORM_EPS, vb.pp("fn.norm"))?;
        let norm_out = if sandwich {
            Some(layer_norm(dim, LAYER_NORM_EPS, vb.pp("fn.norm_out"))?)
        } else {
            None
        };
        Ok(Self {
            scale,
            norm,
            norm_out,
        })
    }

    fn finish(&self, xs: Tensor) -> Result<Tensor> {
        let xs = match &self.norm_out {
            Some(norm_out) => xs.apply(norm_out)?,
            None => xs,
        };
        xs.broadcast_mul(&self.scale)
    }
}

#[derive(Debug, Clone)]
struct Layer {
    attn_norm: ScaledPreNorm,
    attn: Attention,
    ff_norm: ScaledPreNorm,
    ff: FeedForward,
}

impl Layer {
    fn new(cfg: &DalleConfig, vb: VarBuilder) -> Result<Self> {
        let vb_a = vb.pp(0);
        let attn_norm = ScaledPreNorm::new(cfg.dim, cfg.sandwich_norm, vb_a.clone())?;
        let attn = Attention::new(cfg.dim, cfg.heads, cfg.dim_head, vb_a.pp("fn.fn.fn"))?;
        let vb_f = vb.pp(1);
        let ff_norm = ScaledPreNorm::new(cfg.dim, cfg.sandwich_norm, vb_f.clone())?;
        let ff = FeedForward::new(cfg.dim, cfg.ff_mult, vb_f.pp("fn.fn"))?;
        Ok(Self {
            attn_norm,
            attn,
            ff_norm,
            ff,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let ys = self.attn.forward(&xs.apply(&self.attn_norm.norm)?, mask)?;
        let xs = (xs + self.attn_norm.finish(ys)?)?;
        let ys = xs.apply(&self.ff_norm.norm)?.apply(&self.ff)?;
        &xs + self.ff_norm.finish(ys)?
    }
}

#[derive(Debug, Clone)]
pub struct Transformer {
    layers: Vec<Layer>,
    span: tracing::Span,
}

impl Transformer {
    pub fn new(cfg: &DalleConfig, vb: VarBuilder) -> Result<Self> {
        let vb_l = vb.pp("layers.layers");
        let layers = (0..cfg.depth)
            .map(|i| Layer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "transformer");
        Ok(Self { layers, span })
    }

    /// Runs `xs`, the embeddings of the tokens at positions `offset..`, through the
    /// layers. Earlier positions come from the key-value cache.
    pub fn forward(&mut self, xs: &Tensor, offset: usize) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b, seq_len, _) = xs.dims3()?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, xs.device())?)
        } else {
            None
        };
        let mut xs = xs.clone();
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask.as_ref())?
        }
        Ok(xs)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.attn.clear_kv_cache()
        }
    }
}
