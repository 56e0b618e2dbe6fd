//! LoRA checkpoint resolution, loading and writing.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use thiserror::Error;
use tracing::{debug, info};

use super::convert::ConvertError;
use super::types::{StateDict, LORA_WEIGHT_NAME, LORA_WEIGHT_NAME_SAFE};

/// Errors that can occur during LoRA loading and saving.
#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error("provided path contains more than one weights file in the {extension} format: {candidates:?}; pass `weight_name` to choose one")]
    AmbiguousWeights {
        extension: String,
        candidates: Vec<String>,
    },
    #[error("LoRA weights not found at {0}")]
    WeightsNotFound(String),
    #[error("failed to load weights: {0}")]
    WeightsLoad(String),
    #[error("failed to write weights: {0}")]
    WeightsWrite(String),
    #[error("hub error: {0}")]
    Hub(String),
    #[error("provided path ({0}) should be a directory, not a file")]
    NotADirectory(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

/// Where a checkpoint comes from.
#[derive(Debug)]
pub enum CheckpointSource {
    /// An in-memory key/tensor mapping.
    StateDict(StateDict),
    /// A local file or directory.
    Path(PathBuf),
    /// A hub repository id.
    Hub(String),
}

impl CheckpointSource {
    /// Interpret a command-line style argument: an existing path is local,
    /// anything else is a hub repository id.
    pub fn parse(source: &str) -> Self {
        let path = Path::new(source);
        if path.exists() {
            CheckpointSource::Path(path.to_path_buf())
        } else {
            CheckpointSource::Hub(source.to_string())
        }
    }
}

impl From<StateDict> for CheckpointSource {
    fn from(state_dict: StateDict) -> Self {
        CheckpointSource::StateDict(state_dict)
    }
}

impl From<PathBuf> for CheckpointSource {
    fn from(path: PathBuf) -> Self {
        CheckpointSource::Path(path)
    }
}

impl From<&Path> for CheckpointSource {
    fn from(path: &Path) -> Self {
        CheckpointSource::Path(path.to_path_buf())
    }
}

/// Options controlling checkpoint resolution and adapter registration.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Explicit file name inside a directory or repository.
    pub weight_name: Option<String>,
    /// `Some(true)` forces safetensors, `Some(false)` forces the legacy
    /// format, `None` tries safetensors and falls back.
    pub use_safetensors: Option<bool>,
    pub subfolder: Option<String>,
    pub revision: Option<String>,
    /// Name for the new adapter; `default_<n>` when absent.
    pub adapter_name: Option<String>,
    /// Add the adapter to the active set after loading.
    pub activate: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            weight_name: None,
            use_safetensors: None,
            subfolder: None,
            revision: None,
            adapter_name: None,
            activate: true,
        }
    }
}

impl LoadOptions {
    pub fn with_weight_name(mut self, weight_name: impl Into<String>) -> Self {
        self.weight_name = Some(weight_name.into());
        self
    }

    pub fn with_adapter_name(mut self, adapter_name: impl Into<String>) -> Self {
        self.adapter_name = Some(adapter_name.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum WeightFormat {
    Safetensors,
    Pickle,
}

impl WeightFormat {
    fn extension(&self) -> &'static str {
        match self {
            WeightFormat::Safetensors => ".safetensors",
            WeightFormat::Pickle => ".bin",
        }
    }

    fn default_name(&self) -> &'static str {
        match self {
            WeightFormat::Safetensors => LORA_WEIGHT_NAME_SAFE,
            WeightFormat::Pickle => LORA_WEIGHT_NAME,
        }
    }
}

/// A resolved checkpoint location.
enum Location {
    File(PathBuf),
    Directory(PathBuf),
    Hub {
        repo: ApiRepo,
        subfolder: Option<String>,
    },
}

/// File names that are never LoRA weights.
const EXCLUDED_NAME_PARTS: [&str; 3] = ["scheduler", "optimizer", "checkpoint"];

/// LoRA checkpoint loader.
///
/// Resolves a [`CheckpointSource`] to one weights file (safetensors
/// preferred, legacy pickle as fallback) and reads it onto `device`.
pub struct LoraLoader {
    device: Device,
    /// Floating-point tensors are converted to this dtype when set.
    dtype: Option<DType>,
}

impl LoraLoader {
    /// Create a new loader for the specified device and dtype.
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype: Some(dtype),
        }
    }

    /// Loader that keeps each tensor's stored dtype.
    pub fn native_dtype(device: Device) -> Self {
        Self {
            device,
            dtype: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Resolve and read a raw checkpoint.
    pub fn load_state_dict(
        &self,
        source: CheckpointSource,
        options: &LoadOptions,
    ) -> Result<StateDict, LoraLoadError> {
        let location = match source {
            CheckpointSource::StateDict(state_dict) => return Ok(state_dict),
            CheckpointSource::Path(path) => local_location(path, options)?,
            CheckpointSource::Hub(repo_id) => hub_location(repo_id, options)?,
        };

        let allow_pickle = options.use_safetensors.is_none();
        let use_safetensors = options.use_safetensors.unwrap_or(true);
        let weight_name = options.weight_name.as_deref();

        if (use_safetensors && weight_name.is_none())
            || weight_name.is_some_and(|n| n.ends_with(".safetensors"))
        {
            match self.load_format(&location, weight_name, WeightFormat::Safetensors) {
                Ok(state_dict) => return Ok(state_dict),
                Err(e @ LoraLoadError::AmbiguousWeights { .. }) => return Err(e),
                Err(e) if !allow_pickle => return Err(e),
                Err(e) => debug!(error = %e, "safetensors load failed, trying legacy format"),
            }
        }

        self.load_format(&location, weight_name, WeightFormat::Pickle)
    }

    fn load_format(
        &self,
        location: &Location,
        weight_name: Option<&str>,
        format: WeightFormat,
    ) -> Result<StateDict, LoraLoadError> {
        let name = match weight_name {
            Some(name) => name.to_string(),
            None => best_guess_weight_name(location, format.extension())?
                .unwrap_or_else(|| format.default_name().to_string()),
        };
        let path = resolve_file(location, &name)?;
        info!(path = %path.display(), ?format, "loading LoRA weights");
        match format {
            WeightFormat::Safetensors => self.load_safetensors(&path),
            WeightFormat::Pickle => self.load_pickle(&path),
        }
    }

    /// Load weights from safetensors file.
    fn load_safetensors(&self, path: &Path) -> Result<StateDict, LoraLoadError> {
        let tensors = candle_core::safetensors::load(path, &self.device)
            .map_err(|e| LoraLoadError::WeightsLoad(format!("{}: {e}", path.display())))?;

        let mut result = StateDict::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            result.insert(name, self.convert_dtype(tensor)?);
        }
        Ok(result)
    }

    /// Load weights from pickle (.bin) file.
    fn load_pickle(&self, path: &Path) -> Result<StateDict, LoraLoadError> {
        let tensors = candle_core::pickle::read_all(path)
            .map_err(|e| LoraLoadError::WeightsLoad(format!("{}: {e}", path.display())))?;

        let mut result = StateDict::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            let tensor = tensor
                .to_device(&self.device)
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            result.insert(name, self.convert_dtype(tensor)?);
        }
        Ok(result)
    }

    fn convert_dtype(&self, tensor: Tensor) -> Result<Tensor, LoraLoadError> {
        match self.dtype {
            Some(dtype) if tensor.dtype() != dtype && tensor.dtype().is_float() => tensor
                .to_dtype(dtype)
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string())),
            _ => Ok(tensor),
        }
    }
}

fn local_location(path: PathBuf, options: &LoadOptions) -> Result<Location, LoraLoadError> {
    if path.is_file() {
        return Ok(Location::File(path));
    }
    let dir = match &options.subfolder {
        Some(subfolder) => path.join(subfolder),
        None => path,
    };
    if dir.is_dir() {
        Ok(Location::Directory(dir))
    } else {
        Err(LoraLoadError::WeightsNotFound(dir.display().to_string()))
    }
}

fn hub_location(repo_id: String, options: &LoadOptions) -> Result<Location, LoraLoadError> {
    let api = Api::new().map_err(|e| LoraLoadError::Hub(e.to_string()))?;
    let revision = options.revision.clone().unwrap_or_else(|| "main".to_string());
    let repo = api.repo(Repo::with_revision(repo_id, RepoType::Model, revision));
    Ok(Location::Hub {
        repo,
        subfolder: options.subfolder.clone(),
    })
}

/// File names directly inside `location` that end with `extension`.
fn list_weight_files(location: &Location, extension: &str) -> Result<Vec<String>, LoraLoadError> {
    let mut files = match location {
        Location::File(_) => return Ok(Vec::new()),
        Location::Directory(dir) => {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            files
        }
        Location::Hub { repo, subfolder } => {
            let info = repo.info().map_err(|e| LoraLoadError::Hub(e.to_string()))?;
            let prefix = subfolder.as_ref().map(|s| format!("{}/", s.trim_end_matches('/')));
            info.siblings
                .into_iter()
                .filter_map(|s| match &prefix {
                    Some(prefix) => s.rfilename.strip_prefix(prefix.as_str()).map(str::to_string),
                    None => Some(s.rfilename),
                })
                .filter(|name| !name.contains('/'))
                .collect()
        }
    };
    files.retain(|f| f.ends_with(extension));
    files.sort();
    Ok(files)
}

/// Pick the weights file when none was named.
///
/// Single files return `None`. Candidates mentioning schedulers, optimizers
/// or checkpoints are dropped, the default LoRA file names win, and more than
/// one remaining candidate is an error.
fn best_guess_weight_name(
    location: &Location,
    extension: &str,
) -> Result<Option<String>, LoraLoadError> {
    let mut candidates = list_weight_files(location, extension)?;
    if candidates.is_empty() {
        return Ok(None);
    }
    candidates.retain(|f| !EXCLUDED_NAME_PARTS.iter().any(|part| f.contains(part)));

    for preferred in [LORA_WEIGHT_NAME, LORA_WEIGHT_NAME_SAFE] {
        if candidates.iter().any(|f| f.ends_with(preferred)) {
            candidates.retain(|f| f.ends_with(preferred));
            break;
        }
    }

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        _ => Err(LoraLoadError::AmbiguousWeights {
            extension: extension.to_string(),
            candidates,
        }),
    }
}

fn resolve_file(location: &Location, weight_name: &str) -> Result<PathBuf, LoraLoadError> {
    match location {
        Location::File(path) => Ok(path.clone()),
        Location::Directory(dir) => {
            let path = dir.join(weight_name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(LoraLoadError::WeightsNotFound(path.display().to_string()))
            }
        }
        Location::Hub { repo, subfolder } => {
            let filename = match subfolder {
                Some(subfolder) => format!("{}/{weight_name}", subfolder.trim_end_matches('/')),
                None => weight_name.to_string(),
            };
            repo.get(&filename)
                .map_err(|e| LoraLoadError::Hub(format!("{filename}: {e}")))
        }
    }
}

/// Write a packed state dict into `save_directory`.
///
/// Returns the written path, or `None` on non-main processes. Only
/// safetensors can be written.
pub fn write_lora_layers(
    state_dict: &StateDict,
    save_directory: impl AsRef<Path>,
    is_main_process: bool,
    weight_name: Option<&str>,
    safe_serialization: bool,
) -> Result<Option<PathBuf>, LoraLoadError> {
    let dir = save_directory.as_ref();
    if dir.is_file() {
        return Err(LoraLoadError::NotADirectory(dir.display().to_string()));
    }
    if !safe_serialization {
        return Err(LoraLoadError::UnsupportedFormat(
            "legacy pickle archives can be read but not written; use safetensors".to_string(),
        ));
    }
    if !is_main_process {
        debug!(dir = %dir.display(), "not the main process, skipping LoRA weight write");
        return Ok(None);
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(weight_name.unwrap_or(LORA_WEIGHT_NAME_SAFE));
    candle_core::safetensors::save(state_dict, &path)
        .map_err(|e| LoraLoadError::WeightsWrite(e.to_string()))?;
    info!(path = %path.display(), tensors = state_dict.len(), "model weights saved");
    Ok(Some(path))
}

/// Prefix every key with `<prefix>.`.
pub fn pack_weights(layers: StateDict, prefix: &str) -> StateDict {
    layers
        .into_iter()
        .map(|(key, tensor)| (format!("{prefix}.{key}"), tensor))
        .collect()
}
