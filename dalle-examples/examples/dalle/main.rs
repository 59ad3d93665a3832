#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::{Context, Result};
use candle::{DType, Device};
use candle_nn::VarBuilder;
use clap::{ArgAction, Parser};
use std::collections::HashMap;
use std::path::PathBuf;

use dalle_examples::dalle::{run_prompt, split_prompts, DalleGenerator};
use dalle_transformers::generation::TopKSampler;
use dalle_transformers::models::dalle::checkpoint::{load_weights, remap_legacy_keys, Checkpoint};
use dalle_transformers::models::dalle::discrete_vae::DiscreteVae;
use dalle_transformers::models::dalle::openai_vae::{OpenAiVae, OpenAiVaeConfig};
use dalle_transformers::models::dalle::tokenizer::{
    ChineseTokenizer, HugTokenizer, SimpleTokenizer, TextTokenizer, TokenizerKind,
    YttmTokenizer,
};
use dalle_transformers::models::dalle::vae::{check_vae_class, ImageCodec, Vae, VaeKind};
use dalle_transformers::models::dalle::vqgan::{VqGan, VqGanConfig};
use dalle_transformers::models::dalle::Dalle;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the trained DALL-E, a .pt or .safetensors checkpoint.
    #[arg(long = "dalle_path", value_name = "FILE", default_value = "dalle.pt")]
    dalle_path: PathBuf,

    /// Path to the trained VQGAN weights, a .ckpt file (only used with --taming).
    #[arg(long = "vqgan_model_path", value_name = "FILE", default_value = "vqgan.ckpt")]
    vqgan_model_path: PathBuf,

    /// Path to the VQGAN config, a .yaml file (only used with --taming).
    #[arg(long = "vqgan_config_path", value_name = "FILE", default_value = "vqgan.yaml")]
    vqgan_config_path: PathBuf,

    /// The OpenAI dVAE decoder weights, used when the checkpoint does not embed them.
    #[arg(long = "openai_vae_path", value_name = "FILE")]
    openai_vae_path: Option<PathBuf>,

    /// The text prompts, separated by `|`.
    #[arg(long, default_value = "fireflies in a field under a full moon")]
    text: String,

    /// Number of images generated per prompt.
    #[arg(long = "num_images", default_value_t = 128)]
    num_images: usize,

    #[arg(long = "batch_size", default_value_t = 4)]
    batch_size: usize,

    /// Top-k filter threshold, 0.9 keeps the 10% most likely tokens.
    #[arg(long = "top_k", default_value_t = 0.9)]
    top_k: f64,

    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// The seed to use when sampling.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    #[arg(long = "outputs_dir", default_value = "./outputs")]
    outputs_dir: PathBuf,

    /// Path to a custom tokenizer, a YouTokenToMe model or a tokenizers json with --hug.
    #[arg(long = "bpe_path", value_name = "FILE")]
    bpe_path: Option<PathBuf>,

    #[arg(long)]
    hug: bool,

    #[arg(long)]
    chinese: bool,

    /// Local tokenizer.json for the CLIP or Chinese tokenizer, downloaded from the hub
    /// when not set.
    #[arg(long, value_name = "FILE")]
    tokenizer: Option<PathBuf>,

    /// Decode with the VQGAN, use --taming=false for the other codecs.
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    taming: bool,

    /// Replace each prompt with a caption generated from it.
    #[arg(long)]
    gentxt: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFile {
    ClipTokenizer,
    ChineseTokenizer,
}

impl ModelFile {
    fn get(&self, filename: Option<PathBuf>) -> Result<PathBuf> {
        let (repo, path) = match self {
            Self::ClipTokenizer => ("openai/clip-vit-base-patch32", "tokenizer.json"),
            Self::ChineseTokenizer => ("bert-base-chinese", "tokenizer.json"),
        };
        Ok(dalle_examples::hub_file(repo, path, filename)?)
    }
}

fn build_tokenizer(args: &Args) -> Result<Box<dyn TextTokenizer>> {
    let kind = TokenizerKind::select(args.bpe_path.as_deref(), args.hug, args.chinese);
    tracing::info!(?kind, "building the tokenizer");
    let tokenizer: Box<dyn TextTokenizer> = match kind {
        TokenizerKind::Hug(p) => Box::new(HugTokenizer::from_file(p)?),
        TokenizerKind::Yttm(p) => Box::new(YttmTokenizer::from_file(p)?),
        TokenizerKind::Chinese => {
            let file = ModelFile::ChineseTokenizer.get(args.tokenizer.clone())?;
            Box::new(ChineseTokenizer::from_file(file)?)
        }
        TokenizerKind::Simple => {
            let file = ModelFile::ClipTokenizer.get(args.tokenizer.clone())?;
            Box::new(SimpleTokenizer::from_file(file)?)
        }
    };
    Ok(tokenizer)
}

const OPENAI_DECODER_KEY: &str = "vae.dec.blocks.input.w";

fn build_vae(
    kind: VaeKind,
    args: &Args,
    checkpoint: &Checkpoint,
    vb: &VarBuilder,
    dtype: DType,
    device: &Device,
) -> Result<Vae> {
    tracing::info!(vae = kind.class_name(), "building the vae");
    let vae = match kind {
        VaeKind::VqGan => {
            let config = VqGanConfig::from_file(&args.vqgan_config_path).with_context(|| {
                format!("cannot read the vqgan config {:?}", args.vqgan_config_path)
            })?;
            let mut weights: HashMap<_, _> =
                load_weights(&args.vqgan_model_path, Some("state_dict"), device)?;
            // Weights fine-tuned along with DALL-E take precedence.
            weights.extend(checkpoint.sub_weights("vae.model."));
            let vb = VarBuilder::from_tensors(weights, dtype, device);
            Vae::VqGan(VqGan::new(config, vb)?)
        }
        VaeKind::Discrete => {
            let config = checkpoint.vae_params.clone().unwrap_or_default();
            Vae::Discrete(DiscreteVae::new(config, vb.pp("vae"))?)
        }
        VaeKind::OpenAi => {
            let config = OpenAiVaeConfig::default();
            if checkpoint.weights.contains_key(OPENAI_DECODER_KEY) {
                Vae::OpenAi(OpenAiVae::new(config, vb.pp("vae.dec"))?)
            } else {
                let path = match &args.openai_vae_path {
                    Some(path) => path,
                    None => anyhow::bail!(
                        "the checkpoint does not hold the OpenAI dVAE decoder, pass --openai_vae_path"
                    ),
                };
                let weights = load_weights(path, None, device)?;
                let vb = VarBuilder::from_tensors(weights, dtype, device);
                Vae::OpenAi(OpenAiVae::new(config, vb)?)
            }
        }
    };
    Ok(vae)
}

fn run(args: Args) -> Result<()> {
    let device = dalle_examples::device(args.cpu)?;
    let dtype = dalle_examples::dtype(&device);

    let checkpoint = Checkpoint::load(&args.dalle_path, &device)?;
    println!("{}", checkpoint.version_notice());

    let kind = VaeKind::select(args.taming, checkpoint.vae_params.is_some());
    let weights = remap_legacy_keys(checkpoint.weights.clone());
    let vb = VarBuilder::from_tensors(weights, dtype, &device);
    let vae = build_vae(kind, &args, &checkpoint, &vb, dtype, &device)?;
    check_vae_class(checkpoint.vae_class_name.as_deref(), vae.class_name())?;
    let tokenizer = build_tokenizer(&args)?;

    tracing::info!("building the transformer");
    let model = Dalle::new(checkpoint.hparams.clone(), vae, vb)?;
    drop(checkpoint);
    let sampler = TopKSampler::new(args.seed, args.top_k, args.temperature);
    let mut generator = DalleGenerator {
        model,
        sampler,
        tokenizer,
    };

    for prompt in split_prompts(&args.text) {
        let dir = run_prompt(
            &mut generator,
            prompt,
            args.gentxt,
            &args.outputs_dir,
            args.num_images,
            args.batch_size,
        )?;
        println!("created {} images at {:?}", args.num_images, dir.display().to_string());
    }
    Ok(())
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };
    run(args)
}
