//! Persistent configuration for the `difflora` tool.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`<config dir>/difflora/config.toml`)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resnet layers per UNet block when neither the CLI nor the file says.
pub const DEFAULT_LAYERS_PER_BLOCK: usize = 2;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// UNet `layers_per_block`, used to renumber SGM checkpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers_per_block: Option<usize>,

    /// Device to load tensors on (cpu, cuda, cuda:N, metal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Convert floating-point tensors to this dtype (bf16, fp16, fp32).
    /// Stored dtypes are kept when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Directory `convert` writes into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,

    /// Write safetensors. Setting this to false makes `convert` fail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_serialization: Option<bool>,

    /// Hub revision for repository sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl CliConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("difflora").join("config.toml"))
    }

    /// Load configuration from the default path. A missing or unreadable
    /// file yields the defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.layers_per_block.is_some() {
            self.layers_per_block = other.layers_per_block;
        }
        if other.device.is_some() {
            self.device = other.device.clone();
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.output_dir.is_some() {
            self.output_dir = other.output_dir.clone();
        }
        if other.safe_serialization.is_some() {
            self.safe_serialization = other.safe_serialization;
        }
        if other.revision.is_some() {
            self.revision = other.revision.clone();
        }
    }

    pub fn layers_per_block(&self) -> usize {
        self.layers_per_block.unwrap_or(DEFAULT_LAYERS_PER_BLOCK)
    }

    pub fn safe_serialization(&self) -> bool {
        self.safe_serialization.unwrap_or(true)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn device(&self) -> Result<Device, ConfigError> {
        parse_device(self.device.as_deref().unwrap_or("cpu"))
    }

    pub fn dtype(&self) -> Result<Option<DType>, ConfigError> {
        self.dtype.as_deref().map(parse_dtype).transpose()
    }
}

pub fn parse_dtype(dtype: &str) -> Result<DType, ConfigError> {
    match dtype {
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "fp16" | "float16" | "half" => Ok(DType::F16),
        "fp32" | "float32" | "float" => Ok(DType::F32),
        other => Err(ConfigError::Invalid(format!(
            "unknown dtype '{other}'. Supported: bf16, fp16, fp32"
        ))),
    }
}

pub fn parse_device(device: &str) -> Result<Device, ConfigError> {
    let unavailable = |e: candle_core::Error| ConfigError::Invalid(format!("device {device}: {e}"));
    match device {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0).map_err(unavailable),
        "metal" => Device::new_metal(0).map_err(unavailable),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Device::new_cuda(ordinal).map_err(unavailable),
            _ => Err(ConfigError::Invalid(format!(
                "unknown device '{other}'. Supported: cpu, cuda, cuda:N, metal"
            ))),
        },
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// `dirs::config_dir` found nothing.
    #[error("no user config directory on this platform")]
    NoConfigDir,
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("difflora").join("config.toml");

        let config = CliConfig {
            layers_per_block: Some(1),
            dtype: Some("fp16".to_string()),
            output_dir: Some(PathBuf::from("/tmp/loras")),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_merge() {
        let mut base = CliConfig {
            layers_per_block: Some(2),
            revision: Some("main".to_string()),
            ..Default::default()
        };
        let cli = CliConfig {
            layers_per_block: Some(1),
            safe_serialization: Some(false),
            ..Default::default()
        };

        base.merge(&cli);

        assert_eq!(base.layers_per_block, Some(1)); // Overridden
        assert_eq!(base.revision, Some("main".to_string())); // Unchanged
        assert_eq!(base.safe_serialization, Some(false)); // Added
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::default();
        assert_eq!(config.layers_per_block(), DEFAULT_LAYERS_PER_BLOCK);
        assert!(config.safe_serialization());
        assert_eq!(config.output_dir(), PathBuf::from("."));
        assert!(config.device().unwrap().is_cpu());
        assert_eq!(config.dtype().unwrap(), None);
        assert_eq!(config.to_toml().unwrap().trim(), "");
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_dtype("bfloat16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("half").unwrap(), DType::F16);
        assert!(matches!(parse_dtype("int4"), Err(ConfigError::Invalid(_))));
        assert!(parse_device("cpu").unwrap().is_cpu());
        assert!(matches!(parse_device("tpu"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConfigError::Invalid("unknown dtype 'int4'".to_string()).to_string(),
            "invalid setting: unknown dtype 'int4'"
        );
        assert_eq!(
            ConfigError::NoConfigDir.to_string(),
            "no user config directory on this platform"
        );
        let io = ConfigError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(matches!(io, ConfigError::Io(_)));
        assert_eq!(io.to_string(), "config file I/O failed: gone");
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "layers_per_block = \"two\"").unwrap();
        assert!(matches!(CliConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
