use anyhow::Result;
use candle::{DType, Device, Tensor};
use dalle_examples::dalle::{
    batch_sizes, generate_for_prompt, output_dir, output_dir_name, run_prompt, save_outputs,
    split_prompts, ImageGenerator, CAPTION_FILE,
};

/// Returns constant images whose value is the number of the call, and records the
/// batch sizes it was called with. Captions append " at night" to the prompt.
#[derive(Default)]
struct FakeGenerator {
    calls: Vec<usize>,
    captioned: Vec<String>,
    fail_captions: bool,
}

impl ImageGenerator for FakeGenerator {
    fn generate_images(&mut self, text: &Tensor) -> candle::Result<Tensor> {
        let (b, _) = text.dims2()?;
        let value = self.calls.len() as f64;
        self.calls.push(b);
        Tensor::full(value as f32, (b, 3, 4, 4), &Device::Cpu)
    }

    fn encode_prompt(&self, _prompt: &str) -> candle::Result<Tensor> {
        Tensor::new(&[[5u32, 6, 7, 0]], &Device::Cpu)
    }

    fn generate_caption(&mut self, prompt: &str) -> candle::Result<(Tensor, String)> {
        if self.fail_captions {
            candle::bail!("caption generation failed")
        }
        self.captioned.push(prompt.to_string());
        let tokens = Tensor::new(&[[5u32, 6, 7, 8]], &Device::Cpu)?;
        Ok((tokens, format!("{prompt} at night")))
    }
}

fn prompt_tokens() -> Result<Tensor> {
    Ok(Tensor::new(&[[5u32, 6, 7, 0]], &Device::Cpu)?)
}

fn jpg_count(dir: &std::path::Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        if entry?.path().extension().is_some_and(|e| e == "jpg") {
            count += 1
        }
    }
    Ok(count)
}

#[test]
fn prompts_are_split_on_pipes() {
    assert_eq!(split_prompts("a cat|a dog| a bird"), ["a cat", "a dog", " a bird"]);
    assert_eq!(split_prompts("single"), ["single"]);
}

#[test]
fn output_dir_names() {
    assert_eq!(
        output_dir_name("fireflies in a field under a full moon"),
        "fireflies_in_a_field_under_a_full_moon"
    );
    let long = "word ".repeat(40);
    let name = output_dir_name(&long);
    assert_eq!(name.chars().count(), 100);
    assert!(name.starts_with("word_word_"));
    assert_eq!(
        output_dir(std::path::Path::new("./outputs"), "a b"),
        std::path::Path::new("./outputs/a_b")
    );
}

#[test]
fn batches_cover_all_images() {
    assert_eq!(batch_sizes(128, 4).len(), 32);
    assert_eq!(batch_sizes(10, 4), [4, 4, 2]);
    assert_eq!(batch_sizes(3, 8), [3]);
    assert_eq!(batch_sizes(8, 4), [4, 4]);
    assert!(batch_sizes(0, 4).is_empty());
}

#[test]
fn images_are_generated_in_batches() -> Result<()> {
    let mut generator = FakeGenerator::default();
    let images = generate_for_prompt(&mut generator, &prompt_tokens()?, 10, 4)?;
    assert_eq!(generator.calls, [4, 4, 2]);
    assert_eq!(images.dims(), [10, 3, 4, 4]);
    // Outputs are concatenated in call order.
    let firsts = images
        .flatten_from(1)?
        .narrow(1, 0, 1)?
        .squeeze(1)?
        .to_vec1::<f32>()?;
    assert_eq!(firsts, [0., 0., 0., 0., 1., 1., 1., 1., 2., 2.]);
    Ok(())
}

#[test]
fn invalid_counts_are_rejected() -> Result<()> {
    let mut generator = FakeGenerator::default();
    assert!(generate_for_prompt(&mut generator, &prompt_tokens()?, 0, 4).is_err());
    assert!(generate_for_prompt(&mut generator, &prompt_tokens()?, 4, 0).is_err());
    let two_prompts = Tensor::zeros((2, 4), DType::U32, &Device::Cpu)?;
    assert!(generate_for_prompt(&mut generator, &two_prompts, 4, 2).is_err());
    assert!(generator.calls.is_empty());
    Ok(())
}

#[test]
fn outputs_are_saved_with_caption() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let caption = "a red cube on a blue sphere";
    let dir = output_dir(tmp.path(), caption);
    let images = Tensor::rand(0f32, 1f32, (3, 3, 8, 8), &Device::Cpu)?;
    save_outputs(&dir, &images, caption)?;
    for index in 0..3 {
        let image = image::open(dir.join(format!("{index}.jpg")))?;
        assert_eq!((image.width(), image.height()), (8, 8));
    }
    assert!(!dir.join("3.jpg").exists());
    assert_eq!(std::fs::read_to_string(dir.join(CAPTION_FILE))?, caption);
    Ok(())
}

#[test]
fn local_files_skip_the_hub() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("tokenizer.json");
    std::fs::write(&local, "{}")?;
    let file = dalle_examples::hub_file(
        "openai/clip-vit-base-patch32",
        "tokenizer.json",
        Some(local.clone()),
    )?;
    assert_eq!(file, local);
    Ok(())
}

#[test]
fn images_are_normalized_to_the_full_range() -> Result<()> {
    let img = Tensor::new(&[0.25f32, 0.5, 0.75], &Device::Cpu)?.reshape((3, 1, 1))?;
    let pixels = dalle_examples::normalize_image(&img)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    assert_eq!(pixels, [0, 128, 255]);
    // Constant images do not divide by zero.
    let flat = Tensor::full(0.3f32, (3, 2, 2), &Device::Cpu)?;
    let pixels = dalle_examples::normalize_image(&flat)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    assert!(pixels.iter().all(|&p| p == 0));
    Ok(())
}

#[test]
fn prompts_caption_their_outputs() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut generator = FakeGenerator::default();
    let dir = run_prompt(&mut generator, "a cat", false, tmp.path(), 3, 2)?;
    assert_eq!(dir, tmp.path().join("a_cat"));
    assert!(generator.captioned.is_empty());
    assert_eq!(generator.calls, [2, 1]);
    assert_eq!(std::fs::read_to_string(dir.join(CAPTION_FILE))?, "a cat");
    assert_eq!(jpg_count(&dir)?, 3);
    Ok(())
}

#[test]
fn generated_captions_replace_the_prompt() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut generator = FakeGenerator::default();
    let dir = run_prompt(&mut generator, "a cat", true, tmp.path(), 2, 4)?;
    assert_eq!(generator.captioned, ["a cat"]);
    assert_eq!(dir, tmp.path().join("a_cat_at_night"));
    assert_eq!(std::fs::read_to_string(dir.join(CAPTION_FILE))?, "a cat at night");
    assert_eq!(jpg_count(&dir)?, 2);
    assert!(!tmp.path().join("a_cat").exists());
    Ok(())
}

#[test]
fn failures_abort_before_generation() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut generator = FakeGenerator::default();
    assert!(run_prompt(&mut generator, "a cat", true, tmp.path(), 0, 4).is_err());
    assert!(run_prompt(&mut generator, "a cat", false, tmp.path(), 4, 0).is_err());
    assert!(generator.captioned.is_empty());

    let mut generator = FakeGenerator {
        fail_captions: true,
        ..Default::default()
    };
    let err = run_prompt(&mut generator, "a cat", true, tmp.path(), 4, 2).unwrap_err();
    assert!(err.to_string().contains("caption generation failed"), "{err}");
    assert!(generator.calls.is_empty());
    assert_eq!(std::fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}
