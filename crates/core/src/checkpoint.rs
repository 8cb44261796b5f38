//! Reading checkpoint files into named weight tensors.
//!
//! PyTorch pickles and safetensors files become a [`StateDict`]. Trainers
//! often nest the real weights under a wrapper key (`params`, `params_ema`);
//! those are kept apart from the top-level mapping so the architecture
//! sniffer can tell the two apart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use tracing::{debug, info};

/// Wrapper keys probed in order; the first non-empty one wins.
pub const WRAPPER_KEYS: [&str; 2] = ["params", "params_ema"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    Pytorch,
    Safetensors,
    Onnx,
}

impl CheckpointFormat {
    /// Anything that is not `.onnx` or `.safetensors` is read as a pickle.
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("onnx") => Self::Onnx,
            Some("safetensors") => Self::Safetensors,
            _ => Self::Pytorch,
        }
    }
}

/// Named float32 weight tensors, all on one device.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

impl StateDict {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.tensors
            .get(key)
            .with_context(|| format!("checkpoint is missing tensor '{key}'"))
    }

    pub fn dims(&self, key: &str) -> Result<&[usize]> {
        Ok(self.get(key)?.dims())
    }

    pub fn dim(&self, key: &str, index: usize) -> Result<usize> {
        let dims = self.dims(key)?;
        dims.get(index).copied().with_context(|| {
            format!("tensor '{key}' has shape {dims:?}, expected axis {index}")
        })
    }

    pub fn param_count(&self) -> usize {
        self.tensors.values().map(Tensor::elem_count).sum()
    }

    /// Indices `n` for keys shaped `{prefix}{n}{suffix}`.
    pub fn indices(&self, prefix: &str, suffix: &str) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .keys()
            .filter_map(|key| key.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok())
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Renames every key through `rename`; keys mapped to `None` are dropped.
    pub fn rename_keys(self, rename: impl Fn(&str) -> Option<String>) -> Self {
        let tensors = self
            .tensors
            .into_iter()
            .filter_map(|(key, tensor)| rename(&key).map(|renamed| (renamed, tensor)))
            .collect();
        Self { tensors }
    }

    fn from_raw(
        tensors: impl IntoIterator<Item = (String, Tensor)>,
        device: &Device,
    ) -> Result<Self> {
        let mut converted = HashMap::new();
        for (name, tensor) in tensors {
            let tensor = tensor
                .to_dtype(DType::F32)
                .and_then(|tensor| tensor.to_device(device))
                .and_then(|tensor| tensor.contiguous())
                .with_context(|| format!("failed to prepare tensor '{name}'"))?;
            converted.insert(name, tensor);
        }
        Ok(Self::new(converted))
    }
}

#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub format: CheckpointFormat,
    /// Top-level tensors; empty for ONNX graphs and wrapped checkpoints.
    pub root: StateDict,
    /// Tensors found under a wrapper key, with the key that held them.
    pub wrapped: Option<(String, StateDict)>,
}

impl Checkpoint {
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if !path.is_file() {
            bail!("model file not found: {}", path.display());
        }

        let format = CheckpointFormat::from_path(path);
        let (root, wrapped) = match format {
            CheckpointFormat::Onnx => (StateDict::default(), None),
            CheckpointFormat::Pytorch => load_pickle(path, device)?,
            CheckpointFormat::Safetensors => load_safetensors(path, device)?,
        };

        info!(
            path = %path.display(),
            format = ?format,
            tensors = root.len() + wrapped.as_ref().map_or(0, |(_, dict)| dict.len()),
            wrapper = wrapped.as_ref().map(|(key, _)| key.as_str()),
            "Checkpoint loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            root,
            wrapped,
        })
    }

    pub fn wrapper_key(&self) -> Option<&str> {
        self.wrapped.as_ref().map(|(key, _)| key.as_str())
    }

    /// Tensors under the wrapper key, if any.
    pub fn params(&self) -> Option<&StateDict> {
        self.wrapped.as_ref().map(|(_, dict)| dict)
    }

    /// Wrapped tensors when present, top-level tensors otherwise.
    pub fn weights(&self) -> &StateDict {
        self.params().unwrap_or(&self.root)
    }

    pub fn into_weights(self) -> StateDict {
        match self.wrapped {
            Some((_, dict)) => dict,
            None => self.root,
        }
    }
}

type Loaded = (StateDict, Option<(String, StateDict)>);

fn load_pickle(path: &Path, device: &Device) -> Result<Loaded> {
    for key in WRAPPER_KEYS {
        match candle_core::pickle::read_all_with_key(path, Some(key)) {
            Ok(tensors) if !tensors.is_empty() => {
                debug!(key, count = tensors.len(), "Found wrapped checkpoint tensors");
                let dict = StateDict::from_raw(tensors, device)?;
                return Ok((StateDict::default(), Some((key.to_string(), dict))));
            }
            Ok(_) => {}
            Err(error) => debug!(key, %error, "Wrapper key not present"),
        }
    }

    let tensors = candle_core::pickle::read_all(path)
        .with_context(|| format!("failed to read PyTorch checkpoint: {}", path.display()))?;
    Ok((StateDict::from_raw(tensors, device)?, None))
}

fn load_safetensors(path: &Path, device: &Device) -> Result<Loaded> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read safetensors checkpoint: {}", path.display()))?;
    let (root, wrapped) = split_wrapped(tensors);
    let root = StateDict::from_raw(root, device)?;
    let wrapped = match wrapped {
        Some((key, tensors)) => Some((key, StateDict::from_raw(tensors, device)?)),
        None => None,
    };
    Ok((root, wrapped))
}

/// Safetensors files are flat, so a wrapper shows up as a `params.` style
/// key prefix. Tensors outside the winning prefix stay at the top level.
fn split_wrapped(
    tensors: HashMap<String, Tensor>,
) -> (HashMap<String, Tensor>, Option<(String, HashMap<String, Tensor>)>) {
    for key in WRAPPER_KEYS {
        let prefix = format!("{key}.");
        if !tensors.keys().any(|name| name.starts_with(&prefix)) {
            continue;
        }
        let mut root = HashMap::new();
        let mut wrapped = HashMap::new();
        for (name, tensor) in tensors {
            match name.strip_prefix(&prefix) {
                Some(inner) => {
                    wrapped.insert(inner.to_string(), tensor);
                }
                None => {
                    root.insert(name, tensor);
                }
            }
        }
        return (root, Some((key.to_string(), wrapped)));
    }
    (tensors, None)
}
