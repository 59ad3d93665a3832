//! Driving image generation for a list of prompts and laying out the results.
//!
//! Each prompt gets its own directory under the outputs root, holding the images as
//! `0.jpg`, `1.jpg`, ... and in `caption.txt` the caption, which is the prompt or the
//! text generated from it.
use anyhow::Result;
use candle::Tensor;
use dalle_transformers::generation::TopKSampler;
use dalle_transformers::models::dalle::tokenizer::{tokenize, TextTokenizer};
use dalle_transformers::models::dalle::Dalle;
use std::path::{Path, PathBuf};

pub const PROMPT_SEPARATOR: char = '|';
pub const MAX_DIR_NAME_LEN: usize = 100;
pub const CAPTION_FILE: &str = "caption.txt";

/// Produces images from batches of text tokens.
pub trait ImageGenerator {
    /// Maps `(b, text_seq_len)` tokens to `(b, c, h, w)` images.
    fn generate_images(&mut self, text: &Tensor) -> candle::Result<Tensor>;

    /// The `(1, text_seq_len)` tokens of `prompt`, 0 padded.
    fn encode_prompt(&self, prompt: &str) -> candle::Result<Tensor>;

    /// Completes `prompt` into a caption, returned with its `(1, text_seq_len)` tokens.
    fn generate_caption(&mut self, prompt: &str) -> candle::Result<(Tensor, String)>;
}

pub struct DalleGenerator {
    pub model: Dalle,
    pub sampler: TopKSampler,
    pub tokenizer: Box<dyn TextTokenizer>,
}

impl ImageGenerator for DalleGenerator {
    fn generate_images(&mut self, text: &Tensor) -> candle::Result<Tensor> {
        self.model.generate_images(text, &mut self.sampler)
    }

    fn encode_prompt(&self, prompt: &str) -> candle::Result<Tensor> {
        let text_seq_len = self.model.text_seq_len();
        tokenize(self.tokenizer.as_ref(), &[prompt], text_seq_len, false, self.model.device())
    }

    fn generate_caption(&mut self, prompt: &str) -> candle::Result<(Tensor, String)> {
        self.model.generate_texts(self.tokenizer.as_ref(), prompt, &mut self.sampler)
    }
}

pub fn split_prompts(text: &str) -> Vec<&str> {
    text.split(PROMPT_SEPARATOR).collect()
}

/// Directory name for a prompt: spaces become underscores, at most 100 characters.
pub fn output_dir_name(prompt: &str) -> String {
    prompt
        .replace(' ', "_")
        .chars()
        .take(MAX_DIR_NAME_LEN)
        .collect()
}

pub fn output_dir(outputs_dir: &Path, prompt: &str) -> PathBuf {
    outputs_dir.join(output_dir_name(prompt))
}

/// Sizes of the successive batches needed to produce `num_images` images, all of them
/// `batch_size` but possibly the last one.
pub fn batch_sizes(num_images: usize, batch_size: usize) -> Vec<usize> {
    if batch_size == 0 {
        return vec![];
    }
    (0..num_images)
        .step_by(batch_size)
        .map(|start| usize::min(batch_size, num_images - start))
        .collect()
}

fn check_counts(num_images: usize, batch_size: usize) -> Result<()> {
    if num_images == 0 {
        anyhow::bail!("num_images must be positive")
    }
    if batch_size == 0 {
        anyhow::bail!("batch_size must be positive")
    }
    Ok(())
}

/// Generates `num_images` images for the `(1, text_seq_len)` prompt tokens, one
/// generator call per batch, the outputs being concatenated in order.
pub fn generate_for_prompt<G: ImageGenerator + ?Sized>(
    generator: &mut G,
    tokens: &Tensor,
    num_images: usize,
    batch_size: usize,
) -> Result<Tensor> {
    check_counts(num_images, batch_size)?;
    let (rows, _) = tokens.dims2()?;
    if rows != 1 {
        anyhow::bail!("expected the tokens of a single prompt, got {rows} rows")
    }
    let tokens = tokens.repeat((num_images, 1))?;
    let sizes = batch_sizes(num_images, batch_size);
    let n_batches = sizes.len();
    let mut outputs = Vec::with_capacity(n_batches);
    let mut start = 0;
    for (index, size) in sizes.into_iter().enumerate() {
        let chunk = tokens.narrow(0, start, size)?;
        outputs.push(generator.generate_images(&chunk)?);
        start += size;
        tracing::info!("batch {}/{n_batches} done", index + 1);
    }
    Ok(Tensor::cat(&outputs, 0)?)
}

/// Writes each `(c, h, w)` image of `images` as a normalized jpeg, then the caption.
pub fn save_outputs(dir: &Path, images: &Tensor, caption: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let n_images = images.dim(0)?;
    for index in 0..n_images {
        let image = crate::normalize_image(&images.get(index)?)?;
        crate::save_image(&image, dir.join(format!("{index}.jpg")))?;
    }
    std::fs::write(dir.join(CAPTION_FILE), caption)?;
    tracing::debug!(?dir, n_images, "saved images");
    Ok(())
}

/// Generates and saves the images of a single prompt, returning the directory they were
/// written to. With `gentxt` the prompt is first completed by the model, the generated
/// caption then naming the directory and filling `caption.txt`.
pub fn run_prompt<G: ImageGenerator + ?Sized>(
    generator: &mut G,
    prompt: &str,
    gentxt: bool,
    outputs_dir: &Path,
    num_images: usize,
    batch_size: usize,
) -> Result<PathBuf> {
    check_counts(num_images, batch_size)?;
    let (tokens, caption) = if gentxt {
        let (tokens, caption) = generator.generate_caption(prompt)?;
        tracing::info!("generated caption {caption:?} from {prompt:?}");
        (tokens, caption)
    } else {
        (generator.encode_prompt(prompt)?, prompt.to_string())
    };

    tracing::info!("generating images for - {caption}");
    let start_time = std::time::Instant::now();
    let images = generate_for_prompt(generator, &tokens, num_images, batch_size)?;
    tracing::info!("generated in {:.2}s", start_time.elapsed().as_secs_f32());

    let dir = output_dir(outputs_dir, &caption);
    save_outputs(&dir, &images, &caption)?;
    Ok(dir)
}
