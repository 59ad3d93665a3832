//! Decoder of the discrete VAE released with the original DALL-E.
//!
//! - 💻 [GH Link](https://github.com/openai/DALL-E)
//!
//! The decoder takes a one-hot encoding of the tokens as input, the first 1x1
//! convolution is applied as an embedding lookup instead.
use crate::models::with_tracing::{Conv2d, Embedding};
use candle::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

const LOGIT_LAPLACE_EPS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiVaeConfig {
    pub group_count: usize,
    pub n_init: usize,
    pub n_hid: usize,
    pub n_blk_per_group: usize,
    pub output_channels: usize,
    pub vocab_size: usize,
}

impl Default for OpenAiVaeConfig {
    fn default() -> Self {
        Self {
            group_count: 4,
            n_init: 128,
            n_hid: 256,
            n_blk_per_group: 2,
            output_channels: 3,
            vocab_size: 8192,
        }
    }
}

fn conv(n_in: usize, n_out: usize, kw: usize, vb: VarBuilder) -> Result<Conv2d> {
    let weight = vb.get((n_out, n_in, kw, kw), "w")?;
    let bias = vb.get(n_out, "b")?;
    Conv2d::from_weights(weight, bias)
}

#[derive(Debug)]
struct DecoderBlock {
    id_path: Option<Conv2d>,
    conv_1: Conv2d,
    conv_2: Conv2d,
    conv_3: Conv2d,
    conv_4: Conv2d,
    post_gain: f64,
}

impl DecoderBlock {
    fn new(n_in: usize, n_out: usize, n_layers: usize, vb: VarBuilder) -> Result<Self> {
        let n_hid = n_out / 4;
        let id_path = if n_in != n_out {
            Some(conv(n_in, n_out, 1, vb.pp("id_path"))?)
        } else {
            None
        };
        let vb_r = vb.pp("res_path");
        Ok(Self {
            id_path,
            conv_1: conv(n_in, n_hid, 1, vb_r.pp("conv_1"))?,
            conv_2: conv(n_hid, n_hid, 3, vb_r.pp("conv_2"))?,
            conv_3: conv(n_hid, n_hid, 3, vb_r.pp("conv_3"))?,
            conv_4: conv(n_hid, n_out, 3, vb_r.pp("conv_4"))?,
            post_gain: 1. / (n_layers * n_layers) as f64,
        })
    }
}

impl Module for DecoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let res = xs
            .relu()?
            .apply(&self.conv_1)?
            .relu()?
            .apply(&self.conv_2)?
            .relu()?
            .apply(&self.conv_3)?
            .relu()?
            .apply(&self.conv_4)?;
        let id = match &self.id_path {
            Some(id_path) => xs.apply(id_path)?,
            None => xs.clone(),
        };
        id + (res * self.post_gain)?
    }
}

#[derive(Debug)]
struct Group {
    blocks: Vec<DecoderBlock>,
    upsample: bool,
}

#[derive(Debug)]
pub struct OpenAiVae {
    input: Embedding,
    input_bias: Tensor,
    groups: Vec<Group>,
    output: Conv2d,
    config: OpenAiVaeConfig,
    span: tracing::Span,
}

impl OpenAiVae {
    pub fn new(config: OpenAiVaeConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("blocks");
        let input_w = vb
            .pp("input")
            .get((config.n_init, config.vocab_size, 1, 1), "w")?;
        let input = Embedding::from_weights(
            input_w
                .reshape((config.n_init, config.vocab_size))?
                .t()?
                .contiguous()?,
        )?;
        let input_bias = vb.pp("input").get(config.n_init, "b")?;

        let n_layers = config.group_count * config.n_blk_per_group;
        let mut groups = Vec::with_capacity(config.group_count);
        let mut n_in = config.n_init;
        for group_idx in 0..config.group_count {
            // Widths go 8 * n_hid, 4 * n_hid, ... down to n_hid for the last group.
            let shift = config.group_count - 1 - group_idx;
            let n_out = config.n_hid * (1 << shift);
            let vb_g = vb.pp(format!("group_{}", group_idx + 1));
            let mut blocks = Vec::with_capacity(config.n_blk_per_group);
            for block_idx in 0..config.n_blk_per_group {
                let block_in = if block_idx == 0 { n_in } else { n_out };
                let vb_b = vb_g.pp(format!("block_{}", block_idx + 1));
                blocks.push(DecoderBlock::new(block_in, n_out, n_layers, vb_b)?)
            }
            n_in = n_out;
            groups.push(Group {
                blocks,
                upsample: group_idx + 1 != config.group_count,
            })
        }
        let output = conv(
            config.n_hid,
            2 * config.output_channels,
            1,
            vb.pp("output").pp("conv"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "openai-vae");
        Ok(Self {
            input,
            input_bias,
            groups,
            output,
            config,
            span,
        })
    }

    pub fn config(&self) -> &OpenAiVaeConfig {
        &self.config
    }

    /// Decodes a `(b, h * w)` token sequence into images with values in `[0, 1]`.
    pub fn decode(&self, img_seq: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, n) = img_seq.dims2()?;
        let h = (n as f64).sqrt() as usize;
        let mut xs = self
            .input
            .forward(img_seq)?
            .broadcast_add(&self.input_bias)?
            .reshape((b, h, n / h, self.config.n_init))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        for group in self.groups.iter() {
            for block in group.blocks.iter() {
                xs = xs.apply(block)?
            }
            if group.upsample {
                let (_b, _c, h, w) = xs.dims4()?;
                xs = xs.upsample_nearest2d(h * 2, w * 2)?
            }
        }
        let x_stats = xs.relu()?.apply(&self.output)?.to_dtype(DType::F32)?;
        let x_rec = candle_nn::ops::sigmoid(&x_stats.narrow(1, 0, 3)?)?;
        let scale = 1. / (1. - 2. * LOGIT_LAPLACE_EPS);
        x_rec
            .affine(scale, -LOGIT_LAPLACE_EPS * scale)?
            .clamp(0f32, 1f32)
    }
}
