use candle::{DType, Device, Result, Tensor};
use candle::pickle::Object;
use dalle_transformers::models::dalle::checkpoint::{
    has_legacy_layout, load_weights, object_to_json, remap_legacy_keys, Checkpoint,
};
use dalle_transformers::models::dalle::vae::{check_vae_class, VaeKind};
use dalle_transformers::models::dalle::AttnTypes;
use std::collections::HashMap;

fn write_checkpoint(
    path: &std::path::Path,
    tensors: Vec<(&str, Tensor)>,
    metadata: &[(&str, &str)],
) -> Result<()> {
    let metadata: HashMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    safetensors::tensor::serialize_to_file(tensors, &Some(metadata), path)
        .map_err(candle::Error::wrap)
}

#[test]
fn missing_checkpoint_is_rejected() {
    let err = Checkpoint::load("/definitely/not/here/dalle.pt", &Device::Cpu).unwrap_err();
    assert!(err.to_string().contains("trained DALL-E must exist"), "{err}");
}

#[test]
fn load_safetensors_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dalle.safetensors");
    let emb = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((3, 2))?;
    let codebook = Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?;
    write_checkpoint(
        &path,
        vec![("text_emb.weight", emb), ("vae.codebook.weight", codebook)],
        &[
            (
                "hparams",
                r#"{"dim": 16, "depth": 2, "num_text_tokens": 100, "text_seq_len": 8, "attn_types": ["full"], "loss_img_weight": 7}"#,
            ),
            ("vae_params", r#"{"image_size": 32, "num_tokens": 4, "num_layers": 2}"#),
            ("vae_class_name", "DiscreteVAE"),
            ("version", "1.6.4"),
        ],
    )?;

    let checkpoint = Checkpoint::load(&path, &Device::Cpu)?;
    let hparams = &checkpoint.hparams;
    assert_eq!(hparams.dim, 16);
    assert_eq!(hparams.depth, 2);
    assert_eq!(hparams.num_text_tokens, 100);
    assert_eq!(hparams.text_seq_len, 8);
    assert_eq!(hparams.heads, 8);
    assert_eq!(hparams.dim_head, 64);
    assert_eq!(hparams.attn_types, Some(AttnTypes::Many(vec!["full".to_string()])));
    assert!(!hparams.sandwich_norm);

    let vae_params = checkpoint.vae_params.as_ref().expect("vae params");
    assert_eq!(vae_params.image_size, 32);
    assert_eq!(vae_params.num_tokens, 4);
    assert_eq!(vae_params.num_layers, 2);
    assert_eq!(vae_params.hidden_dim, 64);

    assert_eq!(checkpoint.vae_class_name.as_deref(), Some("DiscreteVAE"));
    assert_eq!(
        checkpoint.version_notice(),
        "Loading a model trained with DALLE-pytorch version 1.6.4"
    );
    assert_eq!(checkpoint.weights.len(), 2);
    let emb = checkpoint.weights["text_emb.weight"].to_vec2::<f32>()?;
    assert_eq!(emb, [[0., 1.], [2., 3.], [4., 5.]]);

    let vae = checkpoint.sub_weights("vae.");
    assert_eq!(vae.keys().collect::<Vec<_>>(), ["codebook.weight"]);
    Ok(())
}

#[test]
fn old_checkpoints_have_no_version() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("old.safetensors");
    let emb = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
    write_checkpoint(
        &path,
        vec![("text_emb.weight", emb)],
        &[("hparams", r#"{"dim": 8, "depth": 1}"#), ("vae_params", "null")],
    )?;
    let checkpoint = Checkpoint::load(&path, &Device::Cpu)?;
    assert!(checkpoint.vae_params.is_none());
    assert!(checkpoint.vae_class_name.is_none());
    assert!(checkpoint.version.is_none());
    assert!(checkpoint.version_notice().starts_with("You are loading a model trained on an older version"));
    assert_eq!(checkpoint.hparams.num_text_tokens, 10000);
    assert_eq!(checkpoint.hparams.text_seq_len, 256);
    Ok(())
}

#[test]
fn checkpoint_without_hparams_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("no_hparams.safetensors");
    let emb = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
    write_checkpoint(&path, vec![("text_emb.weight", emb)], &[("version", "1.0")])?;
    assert!(Checkpoint::load(&path, &Device::Cpu).is_err());
    Ok(())
}

// Minimal pickle protocol 2 writer, enough for the plain-data entries of a torch.save dict.
fn pickle_unicode(out: &mut Vec<u8>, s: &str) {
    out.push(b'X');
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn pickle_int(out: &mut Vec<u8>, v: u8) {
    out.extend_from_slice(&[b'K', v]);
}

fn pickle_float(out: &mut Vec<u8>, v: f64) {
    out.push(b'G');
    out.extend_from_slice(&v.to_be_bytes());
}

/// The pickled dict `torch.save` writes for a DALL-E trained with a VQGAN, with no weights.
fn dalle_pickle() -> Vec<u8> {
    let mut out = vec![0x80, 2, b'}', b'('];
    pickle_unicode(&mut out, "hparams");
    out.extend_from_slice(b"}(");
    for (key, value) in [("dim", 16), ("depth", 2), ("num_text_tokens", 100), ("text_seq_len", 8)] {
        pickle_unicode(&mut out, key);
        pickle_int(&mut out, value);
    }
    pickle_unicode(&mut out, "attn_types");
    pickle_unicode(&mut out, "full");
    out.push(0x85);
    pickle_unicode(&mut out, "loss_img_weight");
    pickle_float(&mut out, 7.0);
    pickle_unicode(&mut out, "sandwich_norm");
    out.push(0x88);
    out.push(b'u');
    pickle_unicode(&mut out, "vae_params");
    out.push(b'N');
    pickle_unicode(&mut out, "weights");
    out.push(b'}');
    pickle_unicode(&mut out, "vae_class_name");
    pickle_unicode(&mut out, "VQGanVAE");
    pickle_unicode(&mut out, "version");
    pickle_unicode(&mut out, "1.6.4");
    out.extend_from_slice(b"u.");
    out
}

fn write_zip(path: &std::path::Path, name: &str, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut zip = zip::ZipWriter::new(std::fs::File::create(path)?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    zip.start_file(name, options).map_err(candle::Error::wrap)?;
    zip.write_all(contents)?;
    zip.finish().map_err(candle::Error::wrap)?;
    Ok(())
}

#[test]
fn load_torch_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dalle.pt");
    write_zip(&path, "archive/data.pkl", &dalle_pickle())?;

    let checkpoint = Checkpoint::load(&path, &Device::Cpu)?;
    let hparams = &checkpoint.hparams;
    assert_eq!(hparams.dim, 16);
    assert_eq!(hparams.depth, 2);
    assert_eq!(hparams.num_text_tokens, 100);
    assert_eq!(hparams.text_seq_len, 8);
    assert!(hparams.sandwich_norm);
    assert_eq!(hparams.attn_types, Some(AttnTypes::Many(vec!["full".to_string()])));
    assert!(checkpoint.vae_params.is_none());
    assert!(checkpoint.weights.is_empty());
    assert_eq!(checkpoint.vae_class_name.as_deref(), Some("VQGanVAE"));
    assert_eq!(checkpoint.version.as_deref(), Some("1.6.4"));
    assert_eq!(VaeKind::select(true, checkpoint.vae_params.is_some()), VaeKind::VqGan);
    Ok(())
}

#[test]
fn torch_checkpoint_without_data_pkl_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.pt");
    write_zip(&path, "archive/version", b"3\n")?;
    let err = Checkpoint::load(&path, &Device::Cpu).unwrap_err();
    assert!(err.to_string().contains("data.pkl"), "{err}");
    Ok(())
}

#[test]
fn pickled_objects_to_json() {
    let text = |s: &str| Object::Unicode(s.to_string());
    let obj = Object::Dict(vec![
        (text("attn_types"), Object::Tuple(vec![text("full")])),
        (text("loss_img_weight"), Object::Float(7.0)),
        (text("depth"), Object::Int(2)),
        (text("stable"), Object::Bool(false)),
        (text("layers"), Object::List(vec![Object::Int(1), Object::None])),
        (Object::Int(3), text("dropped")),
    ]);
    let json = object_to_json(obj).expect("plain data converts");
    assert_eq!(
        json,
        serde_json::json!({
            "attn_types": ["full"],
            "loss_img_weight": 7.0,
            "depth": 2,
            "stable": false,
            "layers": [1, null],
        })
    );
    assert!(object_to_json(Object::Mark).is_none());
}

#[test]
fn load_weights_from_safetensors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vae.safetensors");
    let w = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
    write_checkpoint(&path, vec![("blocks.input.w", w)], &[])?;
    let weights = load_weights(&path, None, &Device::Cpu)?;
    assert_eq!(weights["blocks.input.w"].dims(), [2, 3]);
    assert!(load_weights(dir.path().join("missing.pt"), None, &Device::Cpu).is_err());
    Ok(())
}

fn weights(keys: &[&str]) -> Result<HashMap<String, Tensor>> {
    let t = Tensor::zeros(1, DType::F32, &Device::Cpu)?;
    Ok(keys.iter().map(|k| (k.to_string(), t.clone())).collect())
}

#[test]
fn legacy_keys_are_moved_under_the_cache_wrapper() -> Result<()> {
    let legacy = weights(&[
        "transformer.layers.layers.0.0.fn.fn.to_qkv.weight",
        "transformer.layers.layers.0.0.fn.fn.to_out.0.weight",
        "transformer.layers.layers.0.0.fn.fn.to_out.0.bias",
        "text_emb.weight",
    ])?;
    assert!(has_legacy_layout(&legacy));
    let remapped = remap_legacy_keys(legacy);
    let mut keys = remapped.keys().map(|k| k.as_str()).collect::<Vec<_>>();
    keys.sort();
    assert_eq!(
        keys,
        [
            "text_emb.weight",
            "transformer.layers.layers.0.0.fn.fn.fn.to_out.0.bias",
            "transformer.layers.layers.0.0.fn.fn.fn.to_out.0.weight",
            "transformer.layers.layers.0.0.fn.fn.fn.to_qkv.weight",
        ]
    );
    assert!(!has_legacy_layout(&remapped));

    // Already remapped weights are left untouched.
    let again = remap_legacy_keys(remapped.clone());
    let mut again_keys = again.keys().collect::<Vec<_>>();
    let mut remapped_keys = remapped.keys().collect::<Vec<_>>();
    again_keys.sort();
    remapped_keys.sort();
    assert_eq!(again_keys, remapped_keys);
    Ok(())
}

#[test]
fn vae_selection_follows_the_flags() {
    assert_eq!(VaeKind::select(true, true), VaeKind::VqGan);
    assert_eq!(VaeKind::select(true, false), VaeKind::VqGan);
    assert_eq!(VaeKind::select(false, true), VaeKind::Discrete);
    assert_eq!(VaeKind::select(false, false), VaeKind::OpenAi);
    assert_eq!(VaeKind::VqGan.class_name(), "VQGanVAE");
    assert_eq!(VaeKind::Discrete.class_name(), "DiscreteVAE");
    assert_eq!(VaeKind::OpenAi.class_name(), "OpenAIDiscreteVAE");
}

#[test]
fn vae_class_mismatch_is_rejected() {
    assert!(check_vae_class(None, "VQGanVAE").is_ok());
    assert!(check_vae_class(Some("VQGanVAE"), "VQGanVAE").is_ok());
    let err = check_vae_class(Some("DiscreteVAE"), "VQGanVAE").unwrap_err();
    assert!(
        err.to_string()
            .contains("you trained DALL-E using DiscreteVAE but are trying to generate with VQGanVAE"),
        "{err}"
    );
}
