//! DALL-E: a decoder-only transformer over text tokens followed by image tokens.
//!
//! The text prompt is tokenized, the transformer then samples the tokens of the image
//! one at a time and a discrete image codec turns them into pixels. The same model can
//! also complete a text prompt.
//!
//! - [Paper](https://arxiv.org/abs/2102.12092)
//! - [PyTorch port](https://github.com/lucidrains/DALLE-pytorch)
pub mod checkpoint;
pub mod discrete_vae;
pub mod openai_vae;
pub mod tokenizer;
pub mod transformer;
pub mod vae;
pub mod vqgan;
pub mod yttm;

use crate::generation::TopKSampler;
use crate::models::with_tracing::{linear, Embedding, Linear};
use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{layer_norm, LayerNorm, VarBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokenizer::TextTokenizer;
use transformer::Transformer;
use vae::{ImageCodec, Vae};

/// Attention pattern of the layers, a single value applying to all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttnTypes {
    One(String),
    Many(Vec<String>),
}

impl AttnTypes {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let types: &[String] = match self {
            Self::One(t) => std::slice::from_ref(t),
            Self::Many(ts) => ts.as_slice(),
        };
        types.iter().map(|t| t.as_str())
    }
}

fn default_num_text_tokens() -> usize {
    10000
}

fn default_text_seq_len() -> usize {
    256
}

fn default_heads() -> usize {
    8
}

fn default_dim_head() -> usize {
    64
}

fn default_ff_mult() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DalleConfig {
    pub dim: usize,
    #[serde(default = "default_num_text_tokens")]
    pub num_text_tokens: usize,
    #[serde(default = "default_text_seq_len")]
    pub text_seq_len: usize,
    pub depth: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,
    #[serde(default)]
    pub attn_types: Option<AttnTypes>,
    #[serde(default)]
    pub stable: bool,
    #[serde(default)]
    pub sandwich_norm: bool,
    #[serde(default)]
    pub reversible: bool,
}

impl DalleConfig {
    pub fn total_text_tokens(&self) -> usize {
        self.num_text_tokens + self.text_seq_len
    }

    fn validate(&self) -> Result<()> {
        if let Some(attn_types) = &self.attn_types {
            if let Some(t) = attn_types.iter().find(|&t| t != "full") {
                candle::bail!("attention type {t:?} is not supported, only \"full\" is")
            }
        }
        if self.reversible {
            candle::bail!("reversible transformer layers are not supported")
        }
        if self.depth == 0 || self.dim == 0 {
            candle::bail!("dim and depth must be positive, got {self:?}")
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Dalle {
    text_emb: Embedding,
    image_emb: Embedding,
    text_pos_emb: Embedding,
    // (fmap_size * fmap_size, dim), row-major over the token grid.
    image_pos_emb: Tensor,
    transformer: Transformer,
    norm_logits: LayerNorm,
    to_logits: Linear,
    vae: Vae,
    config: DalleConfig,
    image_seq_len: usize,
    device: Device,
    span: tracing::Span,
}

impl Dalle {
    pub fn new(config: DalleConfig, vae: Vae, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let dim = config.dim;
        let num_image_tokens = vae.num_tokens();
        let fmap_size = vae.fmap_size();
        let image_seq_len = fmap_size * fmap_size;
        let total_text_tokens = config.total_text_tokens();
        let total_tokens = total_text_tokens + num_image_tokens;

        let text_emb = Embedding::new(total_text_tokens, dim, vb.pp("text_emb"))?;
        let image_emb = Embedding::new(num_image_tokens, dim, vb.pp("image_emb"))?;
        let text_pos_emb = Embedding::new(config.text_seq_len + 1, dim, vb.pp("text_pos_emb"))?;
        let vb_p = vb.pp("image_pos_emb");
        let rows = vb_p.get((1, fmap_size, 1, dim), "weights_0")?;
        let cols = vb_p.get((1, 1, fmap_size, dim), "weights_1")?;
        let image_pos_emb = rows
            .broadcast_add(&cols)?
            .reshape((image_seq_len, dim))?;
        let transformer = Transformer::new(&config, vb.pp("transformer"))?;
        let norm_logits = layer_norm(dim, 1e-5, vb.pp("to_logits.0"))?;
        let to_logits = linear(dim, total_tokens, vb.pp("to_logits.1"))?;
        tracing::info!(
            vae = vae.class_name(),
            image_seq_len,
            total_tokens,
            "built dalle"
        );
        Ok(Self {
            text_emb,
            image_emb,
            text_pos_emb,
            image_pos_emb,
            transformer,
            norm_logits,
            to_logits,
            vae,
            config,
            image_seq_len,
            device: vb.device().clone(),
            span: tracing::span!(tracing::Level::TRACE, "dalle"),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn text_seq_len(&self) -> usize {
        self.config.text_seq_len
    }

    pub fn image_seq_len(&self) -> usize {
        self.image_seq_len
    }

    pub fn total_text_tokens(&self) -> usize {
        self.config.total_text_tokens()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_text_tokens() + self.vae.num_tokens()
    }

    /// The ids standing for padding at each text position, padding is encoded per
    /// position so that the model can tell where the text ends.
    pub fn pad_tokens(&self) -> HashSet<u32> {
        let start = self.config.num_text_tokens as u32;
        (start..start + self.config.text_seq_len as u32).collect()
    }

    pub fn clear_kv_cache(&mut self) {
        self.transformer.clear_kv_cache()
    }

    /// Prepends the `<bos>` token and replaces the 0 padding by the per-position pad ids.
    fn prepare_text(&self, text: &Tensor) -> Result<Tensor> {
        let text_seq_len = self.config.text_seq_len;
        let pad_start = self.config.num_text_tokens as u32;
        let rows = text.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let b_size = rows.len();
        let mut ids = Vec::with_capacity(b_size * (text_seq_len + 1));
        for row in rows.iter() {
            ids.push(0);
            for pos in 0..text_seq_len {
                match row.get(pos).copied().unwrap_or(0) {
                    0 => ids.push(pad_start + pos as u32),
                    t => ids.push(t),
                }
            }
        }
        Tensor::from_vec(ids, (b_size, text_seq_len + 1), &self.device)
    }

    fn embed_text(&self, tokens: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, seq_len) = tokens.dims2()?;
        let positions = Tensor::arange(offset as u32, (offset + seq_len) as u32, &self.device)?;
        let pos_emb = self.text_pos_emb.forward(&positions)?;
        self.text_emb.forward(tokens)?.broadcast_add(&pos_emb)
    }

    fn embed_image(&self, tokens: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, seq_len) = tokens.dims2()?;
        let pos_emb = self.image_pos_emb.narrow(0, offset, seq_len)?;
        self.image_emb.forward(tokens)?.broadcast_add(&pos_emb)
    }

    /// Logits for the token following the last position of `xs`, as f32.
    fn next_logits(&mut self, xs: &Tensor, offset: usize) -> Result<Tensor> {
        let xs = self.transformer.forward(xs, offset)?;
        let xs = if self.config.stable {
            xs.broadcast_div(&xs.max_keepdim(D::Minus1)?)?
        } else {
            xs
        };
        let (_b, seq_len, _) = xs.dims3()?;
        xs.narrow(1, seq_len - 1, 1)?
            .squeeze(1)?
            .apply(&self.norm_logits)?
            .apply(&self.to_logits)?
            .to_dtype(DType::F32)
    }

    /// Restricts `(b, total_tokens)` logits to image tokens, or to text tokens when
    /// `image` is false.
    fn mask_logits(&self, logits: &Tensor, image: bool) -> Result<Tensor> {
        let (b_size, n) = logits.dims2()?;
        let t = self.total_text_tokens();
        let (neg_len, keep_start, keep_len) = if image { (t, t, n - t) } else { (n - t, 0, t) };
        let neg = Tensor::full(f32::NEG_INFINITY, (b_size, neg_len), logits.device())?;
        let keep = logits.narrow(1, keep_start, keep_len)?;
        if image {
            Tensor::cat(&[&neg, &keep], 1)
        } else {
            Tensor::cat(&[&keep, &neg], 1)
        }
    }

    /// Samples images for a `(b, text_seq_len)` batch of text tokens, 0 being padding.
    /// Returns `(b, 3, h, w)` images with values in `[0, 1]`.
    pub fn generate_images(&mut self, text: &Tensor, sampler: &mut TopKSampler) -> Result<Tensor> {
        let span = self.span.clone();
        let _enter = span.enter();
        let tokens = self.prepare_text(text)?;
        let (b_size, _) = tokens.dims2()?;
        let total_text_tokens = self.total_text_tokens() as u32;
        self.clear_kv_cache();

        let mut img_seq: Vec<Vec<u32>> = vec![Vec::with_capacity(self.image_seq_len); b_size];
        let mut xs = self.embed_text(&tokens, 0)?;
        let mut offset = 0;
        for step in 0..self.image_seq_len {
            let seq_len = xs.dim(1)?;
            let logits = self.next_logits(&xs, offset)?;
            offset += seq_len;
            let logits = self.mask_logits(&logits, true)?;
            let samples: Vec<u32> = sampler
                .sample_gumbel(&logits)?
                .into_iter()
                .map(|s| s.saturating_sub(total_text_tokens))
                .collect();
            for (seq, &s) in img_seq.iter_mut().zip(samples.iter()) {
                seq.push(s)
            }
            if step + 1 < self.image_seq_len {
                let next = Tensor::from_vec(samples, (b_size, 1), &self.device)?;
                xs = self.embed_image(&next, step)?;
            }
            tracing::trace!(step, "sampled image token");
        }
        self.clear_kv_cache();

        let img_seq = Tensor::from_vec(img_seq.concat(), (b_size, self.image_seq_len), &self.device)?;
        self.vae.decode(&img_seq)
    }

    /// Completes `text` up to `text_seq_len` tokens. Returns the `(1, text_seq_len)`
    /// tokens together with their decoded text, padding excluded.
    pub fn generate_texts(
        &mut self,
        tokenizer: &dyn TextTokenizer,
        text: &str,
        sampler: &mut TopKSampler,
    ) -> Result<(Tensor, String)> {
        let span = self.span.clone();
        let _enter = span.enter();
        let text_seq_len = self.config.text_seq_len;
        let mut tokens = if text.is_empty() {
            vec![0]
        } else {
            tokenizer.encode(text)?
        };
        tokens.truncate(text_seq_len);
        if tokens.is_empty() {
            tokens.push(0)
        }
        self.clear_kv_cache();

        let mut input = tokens.clone();
        let mut offset = 0;
        while tokens.len() < text_seq_len {
            let ids = Tensor::new(input.as_slice(), &self.device)?.unsqueeze(0)?;
            let xs = self.embed_text(&ids, offset)?;
            let logits = self.next_logits(&xs, offset)?;
            offset += input.len();
            let logits = self.mask_logits(&logits, false)?;
            let sample = match sampler.sample_multinomial(&logits)?.first() {
                Some(&sample) => sample,
                None => candle::bail!("sampler returned no token"),
            };
            tokens.push(sample);
            input = vec![sample];
        }
        self.clear_kv_cache();

        let decoded = tokenizer.decode(&tokens, &self.pad_tokens())?;
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok((tokens, decoded))
    }
}
