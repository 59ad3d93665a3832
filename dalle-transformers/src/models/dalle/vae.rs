//! Image codecs mapping images to discrete tokens and back.
//!
//! DALL-E can be trained against three different codecs. The checkpoint records which
//! one was used and generation has to decode with the same one.
use super::discrete_vae::DiscreteVae;
use super::openai_vae::OpenAiVae;
use super::vqgan::VqGan;
use candle::{Result, Tensor};

/// Common interface of the image codecs.
pub trait ImageCodec {
    fn image_size(&self) -> usize;

    /// Number of 2x downsamplings between the image and the token grid.
    fn num_layers(&self) -> usize;

    /// Size of the codebook.
    fn num_tokens(&self) -> usize;

    /// Name of the class the checkpoint records for this codec.
    fn class_name(&self) -> &'static str;

    /// Decodes a `(b, n)` token sequence, `n` being a square, to `(b, c, h, w)` images.
    fn decode(&self, img_seq: &Tensor) -> Result<Tensor>;

    fn fmap_size(&self) -> usize {
        self.image_size() >> self.num_layers()
    }
}

#[derive(Debug)]
pub enum Vae {
    VqGan(VqGan),
    Discrete(DiscreteVae),
    OpenAi(OpenAiVae),
}

impl Vae {
    pub fn kind(&self) -> VaeKind {
        match self {
            Self::VqGan(_) => VaeKind::VqGan,
            Self::Discrete(_) => VaeKind::Discrete,
            Self::OpenAi(_) => VaeKind::OpenAi,
        }
    }
}

impl ImageCodec for Vae {
    fn image_size(&self) -> usize {
        match self {
            Self::VqGan(_) => 256,
            Self::Discrete(vae) => vae.config().image_size,
            Self::OpenAi(_) => 256,
        }
    }

    fn num_layers(&self) -> usize {
        match self {
            Self::VqGan(vae) => vae.num_layers(),
            Self::Discrete(vae) => vae.config().num_layers,
            Self::OpenAi(_) => 3,
        }
    }

    fn num_tokens(&self) -> usize {
        match self {
            Self::VqGan(vae) => vae.config().model.params.n_embed,
            Self::Discrete(vae) => vae.config().num_tokens,
            Self::OpenAi(vae) => vae.config().vocab_size,
        }
    }

    fn class_name(&self) -> &'static str {
        self.kind().class_name()
    }

    fn decode(&self, img_seq: &Tensor) -> Result<Tensor> {
        match self {
            Self::VqGan(vae) => vae.decode(img_seq),
            Self::Discrete(vae) => vae.decode(img_seq),
            Self::OpenAi(vae) => vae.decode(img_seq),
        }
    }
}

/// Which codec to build, in the order the command line flags are looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaeKind {
    VqGan,
    Discrete,
    OpenAi,
}

impl VaeKind {
    pub fn select(taming: bool, has_vae_params: bool) -> Self {
        if taming {
            Self::VqGan
        } else if has_vae_params {
            Self::Discrete
        } else {
            Self::OpenAi
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::VqGan => "VQGanVAE",
            Self::Discrete => "DiscreteVAE",
            Self::OpenAi => "OpenAIDiscreteVAE",
        }
    }
}

/// Checks that generation uses the codec the model was trained with.
pub fn check_vae_class(recorded: Option<&str>, actual: &str) -> Result<()> {
    match recorded {
        Some(recorded) if recorded != actual => candle::bail!(
            "you trained DALL-E using {recorded} but are trying to generate with {actual} - please make sure you are passing in the correct paths and settings for the VAE to use for generation"
        ),
        _ => Ok(()),
    }
}
