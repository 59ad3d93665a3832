//! Discrete VAE trained alongside DALL-E.
//!
//! Only the decoder path is built: codebook lookup followed by transposed convolutions,
//! each doubling the spatial resolution.
use crate::models::with_tracing::{conv2d, conv_transpose2d, Conv2d, ConvTranspose2d, Embedding};
use candle::{Module, Result, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscreteVaeConfig {
    pub image_size: usize,
    pub num_tokens: usize,
    pub codebook_dim: usize,
    pub num_layers: usize,
    pub num_resnet_blocks: usize,
    pub hidden_dim: usize,
    pub channels: usize,
}

impl Default for DiscreteVaeConfig {
    fn default() -> Self {
        Self {
            image_size: 256,
            num_tokens: 512,
            codebook_dim: 512,
            num_layers: 3,
            num_resnet_blocks: 0,
            hidden_dim: 64,
            channels: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct ResBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
}

impl ResBlock {
    fn new(chan: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = candle_nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(chan, chan, 3, cfg, vb.pp("net.0"))?;
        let conv2 = conv2d(chan, chan, 3, cfg, vb.pp("net.2"))?;
        let conv3 = conv2d(chan, chan, 1, Default::default(), vb.pp("net.4"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
        })
    }
}

impl Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .relu()?
            .apply(&self.conv2)?
            .relu()?
            .apply(&self.conv3)?;
        xs + ys
    }
}

#[derive(Debug, Clone)]
enum DecoderLayer {
    Conv(Conv2d),
    Res(ResBlock),
    Up(ConvTranspose2d),
}

impl Module for DecoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(conv) => xs.apply(conv),
            Self::Res(block) => xs.apply(block),
            Self::Up(conv) => xs.apply(conv)?.relu(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscreteVae {
    codebook: Embedding,
    decoder: Vec<DecoderLayer>,
    config: DiscreteVaeConfig,
    span: tracing::Span,
}

impl DiscreteVae {
    pub fn new(config: DiscreteVaeConfig, vb: VarBuilder) -> Result<Self> {
        let codebook = Embedding::new(config.num_tokens, config.codebook_dim, vb.pp("codebook"))?;
        let has_resblocks = config.num_resnet_blocks > 0;
        let dec_init_chan = if has_resblocks {
            config.hidden_dim
        } else {
            config.codebook_dim
        };
        let mut dec_chans = vec![dec_init_chan];
        dec_chans.extend(std::iter::repeat(config.hidden_dim).take(config.num_layers));

        let vb_d = vb.pp("decoder");
        let mut decoder = vec![];
        if has_resblocks {
            let conv = conv2d(
                config.codebook_dim,
                dec_chans[1],
                1,
                Default::default(),
                vb_d.pp(decoder.len()),
            )?;
            decoder.push(DecoderLayer::Conv(conv));
            for _ in 0..config.num_resnet_blocks {
                let block = ResBlock::new(dec_chans[1], vb_d.pp(decoder.len()))?;
                decoder.push(DecoderLayer::Res(block))
            }
        }
        let cfg = candle_nn::ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        for io in dec_chans.windows(2) {
            let conv = conv_transpose2d(io[0], io[1], 4, cfg, vb_d.pp(decoder.len()).pp(0))?;
            decoder.push(DecoderLayer::Up(conv))
        }
        let last_chan = *dec_chans.last().unwrap_or(&dec_init_chan);
        let conv = conv2d(
            last_chan,
            config.channels,
            1,
            Default::default(),
            vb_d.pp(decoder.len()),
        )?;
        decoder.push(DecoderLayer::Conv(conv));
        let span = tracing::span!(tracing::Level::TRACE, "discrete-vae");
        Ok(Self {
            codebook,
            decoder,
            config,
            span,
        })
    }

    pub fn config(&self) -> &DiscreteVaeConfig {
        &self.config
    }

    /// Maps a `(b, h * w)` sequence of codebook indices back to `(b, c, h', w')` images.
    pub fn decode(&self, img_seq: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let image_embeds = self.codebook.forward(img_seq)?;
        let (b, n, d) = image_embeds.dims3()?;
        let h = (n as f64).sqrt() as usize;
        let mut xs = image_embeds
            .reshape((b, h, n / h, d))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        for layer in self.decoder.iter() {
            xs = xs.apply(layer)?
        }
        Ok(xs)
    }
}
