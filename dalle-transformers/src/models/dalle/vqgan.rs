//! VQGAN image codec from taming-transformers.
//!
//! The model is described by the yaml config shipped with the taming checkpoints, only
//! the decoder half is reconstructed here.
//!
//! - 💻 [GH Link](https://github.com/CompVis/taming-transformers)
//! - 📝 [Paper](https://arxiv.org/abs/2012.09841)
use crate::models::with_tracing::{conv2d, Conv2d, Embedding};
use candle::{DType, Module, Result, Tensor, D};
use candle_nn as nn;
use candle_nn::VarBuilder;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecoderConfig {
    pub z_channels: usize,
    pub resolution: usize,
    pub out_ch: usize,
    pub ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attn_resolutions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VqGanParams {
    pub embed_dim: usize,
    pub n_embed: usize,
    pub ddconfig: DecoderConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VqGanModelConfig {
    pub target: String,
    pub params: VqGanParams,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VqGanConfig {
    pub model: VqGanModelConfig,
}

impl VqGanConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(candle::Error::wrap)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(p: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(p.as_ref())?;
        Self::from_yaml(&yaml)
    }

    pub fn is_gumbel(&self) -> bool {
        self.model.target.ends_with("GumbelVQ")
    }

    /// Number of 2x upsamplings between the token grid and the image.
    pub fn num_layers(&self) -> Result<usize> {
        let dd = &self.model.params.ddconfig;
        let f = match dd.attn_resolutions.first() {
            Some(&attn_res) if attn_res > 0 => dd.resolution / attn_res,
            _ => candle::bail!("vqgan config has no attention resolution"),
        };
        Ok(f.max(1).ilog2() as usize)
    }
}

fn normalize(channels: usize, vb: VarBuilder) -> Result<nn::GroupNorm> {
    nn::group_norm(32, channels, 1e-6, vb)
}

#[derive(Debug)]
struct ResnetBlock {
    norm1: nn::GroupNorm,
    conv1: Conv2d,
    norm2: nn::GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let norm1 = normalize(in_channels, vb.pp("norm1"))?;
        let conv1 = conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?;
        let norm2 = normalize(out_channels, vb.pp("norm2"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?;
        let nin_shortcut = if in_channels != out_channels {
            let conv = conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("nin_shortcut"),
            )?;
            Some(conv)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = nn::ops::silu(&xs.apply(&self.norm1)?)?.apply(&self.conv1)?;
        let h = nn::ops::silu(&h.apply(&self.norm2)?)?.apply(&self.conv2)?;
        match &self.nin_shortcut {
            Some(shortcut) => xs.apply(shortcut)? + h,
            None => xs + h,
        }
    }
}

#[derive(Debug)]
struct AttnBlock {
    norm: nn::GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
    scale: f64,
}

impl AttnBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let norm = normalize(channels, vb.pp("norm"))?;
        let q = conv2d(channels, channels, 1, Default::default(), vb.pp("q"))?;
        let k = conv2d(channels, channels, 1, Default::default(), vb.pp("k"))?;
        let v = conv2d(channels, channels, 1, Default::default(), vb.pp("v"))?;
        let proj_out = conv2d(channels, channels, 1, Default::default(), vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            q,
            k,
            v,
            proj_out,
            scale: 1. / (channels as f64).sqrt(),
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = xs.apply(&self.norm)?;
        let (b, c, height, width) = h.dims4()?;
        let q = h.apply(&self.q)?.reshape((b, c, height * width))?;
        let k = h.apply(&self.k)?.reshape((b, c, height * width))?;
        let v = h.apply(&self.v)?.reshape((b, c, height * width))?;
        // (b, hw, c) x (b, c, hw)
        let attn = (q.transpose(1, 2)?.contiguous()?.matmul(&k)? * self.scale)?;
        let attn = nn::ops::softmax(&attn, D::Minus1)?;
        let h = v
            .matmul(&attn.transpose(1, 2)?.contiguous()?)?
            .reshape((b, c, height, width))?
            .apply(&self.proj_out)?;
        xs + h
    }
}

#[derive(Debug)]
struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(channels, channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(h * 2, w * 2)?.apply(&self.conv)
    }
}

#[derive(Debug)]
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Upsample>,
}

#[derive(Debug)]
struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    // Stored from the lowest resolution to the highest one, i.e. in execution order.
    up: Vec<UpLevel>,
    norm_out: nn::GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let num_resolutions = cfg.ch_mult.len();
        if num_resolutions == 0 {
            candle::bail!("vqgan config has an empty ch_mult")
        }
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut block_in = cfg.ch * cfg.ch_mult[num_resolutions - 1];
        let mut curr_res = cfg.resolution / 2usize.pow(num_resolutions as u32 - 1);
        let conv_in = conv2d(cfg.z_channels, block_in, 3, conv_cfg, vb.pp("conv_in"))?;
        let mid_block_1 = ResnetBlock::new(block_in, block_in, vb.pp("mid.block_1"))?;
        let mid_attn_1 = AttnBlock::new(block_in, vb.pp("mid.attn_1"))?;
        let mid_block_2 = ResnetBlock::new(block_in, block_in, vb.pp("mid.block_2"))?;
        let mut up = Vec::with_capacity(num_resolutions);
        for i_level in (0..num_resolutions).rev() {
            let vb_l = vb.pp("up").pp(i_level);
            let block_out = cfg.ch * cfg.ch_mult[i_level];
            let mut blocks = vec![];
            let mut attns = vec![];
            for i_block in 0..cfg.num_res_blocks + 1 {
                blocks.push(ResnetBlock::new(
                    block_in,
                    block_out,
                    vb_l.pp("block").pp(i_block),
                )?);
                block_in = block_out;
                if cfg.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(block_in, vb_l.pp("attn").pp(i_block))?)
                }
            }
            let upsample = if i_level != 0 {
                curr_res *= 2;
                Some(Upsample::new(block_in, vb_l.pp("upsample"))?)
            } else {
                None
            };
            up.push(UpLevel {
                blocks,
                attns,
                upsample,
            })
        }
        let norm_out = normalize(block_in, vb.pp("norm_out"))?;
        let conv_out = conv2d(block_in, cfg.out_ch, 3, conv_cfg, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up,
            norm_out,
            conv_out,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = z
            .apply(&self.conv_in)?
            .apply(&self.mid_block_1)?
            .apply(&self.mid_attn_1)?
            .apply(&self.mid_block_2)?;
        for level in self.up.iter() {
            for (i_block, block) in level.blocks.iter().enumerate() {
                h = h.apply(block)?;
                if let Some(attn) = level.attns.get(i_block) {
                    h = h.apply(attn)?
                }
            }
            if let Some(upsample) = &level.upsample {
                h = h.apply(upsample)?
            }
        }
        let h = nn::ops::silu(&h.apply(&self.norm_out)?)?;
        h.apply(&self.conv_out)
    }
}

#[derive(Debug)]
pub struct VqGan {
    embedding: Embedding,
    post_quant_conv: Conv2d,
    decoder: Decoder,
    num_layers: usize,
    config: VqGanConfig,
    span: tracing::Span,
}

impl VqGan {
    pub fn new(config: VqGanConfig, vb: VarBuilder) -> Result<Self> {
        let num_layers = config.num_layers()?;
        let params = &config.model.params;
        let embed_name = if config.is_gumbel() {
            "quantize.embed"
        } else {
            "quantize.embedding"
        };
        let embedding = Embedding::new(params.n_embed, params.embed_dim, vb.pp(embed_name))?;
        let post_quant_conv = conv2d(
            params.embed_dim,
            params.ddconfig.z_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;
        let decoder = Decoder::new(&params.ddconfig, vb.pp("decoder"))?;
        let span = tracing::span!(tracing::Level::TRACE, "vqgan");
        Ok(Self {
            embedding,
            post_quant_conv,
            decoder,
            num_layers,
            config,
            span,
        })
    }

    pub fn config(&self) -> &VqGanConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Decodes a `(b, h * w)` token sequence into images with values in `[0, 1]`.
    pub fn decode(&self, img_seq: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let z = self.embedding.forward(img_seq)?;
        let (b, n, c) = z.dims3()?;
        let h = (n as f64).sqrt() as usize;
        let z = z.reshape((b, h, n / h, c))?.permute((0, 3, 1, 2))?.contiguous()?;
        let img = z
            .apply(&self.post_quant_conv)?
            .apply(&self.decoder)?
            .to_dtype(DType::F32)?;
        (img.clamp(-1f32, 1f32)? + 1.)? * 0.5
    }
}
