use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The subset of a diffusers UNet `config.json` that LoRA loading needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UNetConfig {
    /// Resnet layers per down block; drives SGM block renumbering.
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,

    #[serde(default)]
    pub block_out_channels: Vec<usize>,
    /// A single width, or one per block.
    #[serde(default)]
    pub cross_attention_dim: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_layers_per_block() -> usize {
    2
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            layers_per_block: default_layers_per_block(),
            block_out_channels: vec![320, 640, 1280, 1280],
            cross_attention_dim: Some(serde_json::Value::from(768)),
            extra: serde_json::Map::new(),
        }
    }
}

impl UNetConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Layers per block with the value `n`.
    pub fn with_layers_per_block(mut self, n: usize) -> Self {
        self.layers_per_block = n;
        self
    }
}
