//! Loading of trained DALL-E checkpoints.
//!
//! A checkpoint bundles the model hyper-parameters, the parameters of the discrete VAE
//! when one was trained alongside, the weights, and some provenance metadata. Two
//! layouts are accepted:
//! - `.safetensors` files, the non-tensor entries being stored as header metadata with
//!   `hparams` and `vae_params` serialized as json,
//! - PyTorch zip checkpoints as written by `torch.save`, holding a dict with `hparams`,
//!   `vae_params`, `weights`, `vae_class_name` and `version` entries.
use super::discrete_vae::DiscreteVaeConfig;
use super::DalleConfig;
use candle::pickle::{Object, PthTensors, Stack};
use candle::{Device, Error as E, Result, Tensor};
use std::collections::HashMap;
use std::path::Path;

pub const HPARAMS_KEY: &str = "hparams";
pub const VAE_PARAMS_KEY: &str = "vae_params";
pub const WEIGHTS_KEY: &str = "weights";
pub const VAE_CLASS_NAME_KEY: &str = "vae_class_name";
pub const VERSION_KEY: &str = "version";

#[derive(Debug)]
pub struct Checkpoint {
    pub hparams: DalleConfig,
    pub vae_params: Option<DiscreteVaeConfig>,
    pub weights: HashMap<String, Tensor>,
    pub vae_class_name: Option<String>,
    pub version: Option<String>,
}

/// Converts the plain-data part of an unpickled object to json, tensors and other
/// python objects are dropped.
pub fn object_to_json(obj: Object) -> Option<serde_json::Value> {
    use serde_json::Value;
    let value = match obj {
        Object::Int(v) => Value::from(v),
        Object::Float(v) => Value::from(v),
        Object::Unicode(v) => Value::String(v),
        Object::Bool(v) => Value::Bool(v),
        Object::None => Value::Null,
        Object::Tuple(vs) | Object::List(vs) => {
            Value::Array(vs.into_iter().filter_map(object_to_json).collect())
        }
        Object::Dict(kvs) => {
            let map = kvs
                .into_iter()
                .filter_map(|(k, v)| {
                    let k = String::try_from(k).ok()?;
                    let v = object_to_json(v)?;
                    Some((k, v))
                })
                .collect();
            Value::Object(map)
        }
        _ => return None,
    };
    Some(value)
}

fn read_pth_entries(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
    let file = std::fs::File::open(path)?;
    let mut zip = zip::ZipArchive::new(std::io::BufReader::new(file)).map_err(E::wrap)?;
    let pkl_name = zip
        .file_names()
        .find(|f| f.ends_with("data.pkl"))
        .map(|f| f.to_string());
    let pkl_name = match pkl_name {
        Some(pkl_name) => pkl_name,
        None => candle::bail!("no data.pkl entry in {path:?}"),
    };
    let reader = zip.by_name(&pkl_name).map_err(E::wrap)?;
    let mut reader = std::io::BufReader::new(reader);
    let mut stack = Stack::empty();
    stack.read_loop(&mut reader)?;
    match stack.finalize()? {
        Object::Dict(kvs) => {
            let entries = kvs
                .into_iter()
                .filter(|(k, _)| !matches!(k, Object::Unicode(k) if k == WEIGHTS_KEY))
                .filter_map(|(k, v)| Some((String::try_from(k).ok()?, object_to_json(v)?)))
                .collect();
            Ok(entries)
        }
        _ => candle::bail!("{path:?} does not hold a dict"),
    }
}

fn read_safetensors_entries(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
    let file = std::fs::File::open(path)?;
    let buffer = unsafe { memmap2::MmapOptions::new().map(&file)? };
    let (_, metadata) = safetensors::SafeTensors::read_metadata(&buffer).map_err(E::wrap)?;
    let mut entries = serde_json::Map::new();
    for (key, value) in metadata.metadata().iter().flatten() {
        let value = match key.as_str() {
            HPARAMS_KEY | VAE_PARAMS_KEY => serde_json::from_str(value).map_err(E::wrap)?,
            _ => serde_json::Value::String(value.clone()),
        };
        entries.insert(key.clone(), value);
    }
    Ok(entries)
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("safetensors")
}

fn optional_string(
    entries: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    match entries.remove(key) {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    }
}

impl Checkpoint {
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            candle::bail!("trained DALL-E must exist, {path:?} not found")
        }
        let mut entries = if is_safetensors(path) {
            read_safetensors_entries(path)?
        } else {
            read_pth_entries(path)?
        };
        let weights = load_weights(path, Some(WEIGHTS_KEY), device)?;
        let hparams = match entries.remove(HPARAMS_KEY) {
            Some(hparams) => serde_json::from_value(hparams).map_err(E::wrap)?,
            None => candle::bail!("no {HPARAMS_KEY} entry in checkpoint {path:?}"),
        };
        let vae_params = match entries.remove(VAE_PARAMS_KEY) {
            None | Some(serde_json::Value::Null) => None,
            Some(params) => Some(serde_json::from_value(params).map_err(E::wrap)?),
        };
        let vae_class_name = optional_string(&mut entries, VAE_CLASS_NAME_KEY);
        let version = optional_string(&mut entries, VERSION_KEY);
        tracing::debug!(?path, n_weights = weights.len(), "loaded checkpoint");
        Ok(Self {
            hparams,
            vae_params,
            weights,
            vae_class_name,
            version,
        })
    }

    /// The notice printed when a checkpoint is loaded.
    pub fn version_notice(&self) -> String {
        match &self.version {
            Some(version) => format!("Loading a model trained with DALLE-pytorch version {version}"),
            None => "You are loading a model trained on an older version of DALL-E pytorch - it may not be compatible with the most recent version".to_string(),
        }
    }

    /// Weights stored under `prefix`, with the prefix stripped.
    pub fn sub_weights(&self, prefix: &str) -> HashMap<String, Tensor> {
        self.weights
            .iter()
            .filter_map(|(k, v)| Some((k.strip_prefix(prefix)?.to_string(), v.clone())))
            .collect()
    }
}

/// Returns true when the attention weights use the layout without the cache wrapper,
/// i.e. `...fn.fn.to_qkv` rather than `...fn.fn.fn.to_qkv`.
pub fn has_legacy_layout(weights: &HashMap<String, Tensor>) -> bool {
    weights.keys().any(|k| k.contains("to_qkv"))
        && !weights.keys().any(|k| k.contains("fn.fn.fn.to_qkv"))
}

/// Moves the attention weights of legacy checkpoints one wrapper deeper.
pub fn remap_legacy_keys(weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    if !has_legacy_layout(&weights) {
        return weights;
    }
    weights
        .into_iter()
        .map(|(k, v)| {
            let k = k
                .replace("to_qkv", "fn.to_qkv")
                .replace("to_out", "fn.to_out")
                .replace("attn_fn", "fn.attn_fn");
            (k, v)
        })
        .collect()
}

/// Loads weights from either a safetensors file or a PyTorch checkpoint, `key` selecting
/// the entry holding the state dict in the latter case.
pub fn load_weights<P: AsRef<Path>>(
    path: P,
    key: Option<&str>,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    if !path.exists() {
        candle::bail!("weight file {path:?} not found")
    }
    if is_safetensors(path) {
        return candle::safetensors::load(path, device);
    }
    let tensors = PthTensors::new(path, key)?;
    let mut weights = HashMap::new();
    for name in tensors.tensor_infos().keys() {
        if let Some(tensor) = tensors.get(name)? {
            weights.insert(name.clone(), tensor.to_device(device)?);
        }
    }
    Ok(weights)
}
