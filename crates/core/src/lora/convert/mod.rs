//! Checkpoint normalization.
//!
//! LoRA checkpoints arrive in several key-naming dialects. Everything is
//! rewritten into the canonical form: keys namespaced by target
//! (`unet.`, `text_encoder.`, `text_encoder_2.`) with alphas split out
//! into a [`NetworkAlphas`] map.

mod dialect;
mod kohya;
mod partition;
mod peft;
mod sgm;

pub use dialect::{detect_dialect, Dialect};
pub use kohya::{convert_kohya_to_diffusers, is_kohya_key};
pub use partition::{partition_by_target, TargetPartition};
pub use peft::{
    alpha_module_path, convert_state_dict_to_peft, group_by_module, require_up_projections,
    split_peft_key, to_peft_key, GroupedWeights,
};
pub use sgm::{is_sgm_key, map_sgm_blocks_to_diffusers};

use candle_core::Tensor;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{NetworkAlphas, StateDict};

/// Errors raised while rewriting checkpoint keys.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("checkpoint mixes {kohya} Kohya-style keys with {other} keys of another naming scheme")]
    MixedDialect { kohya: usize, other: usize },

    #[error("checkpoint mixes {prefixed} target-prefixed keys with {unprefixed} unprefixed keys")]
    MixedPrefixes { prefixed: usize, unprefixed: usize },

    #[error("checkpoint uses SGM block numbering but no layers_per_block was configured")]
    MissingLayersPerBlock,

    #[error("checkpoint not supported: unrecognized layer in key {key}")]
    UnsupportedLayer { key: String },

    #[error("invalid block id {id} in key {key}")]
    InvalidBlockId { key: String, id: String },

    #[error("invalid middle block id {id} in key {key}")]
    InvalidMiddleBlock { key: String, id: usize },

    #[error("invalid input block id 0 in key {key}")]
    InvalidInputBlock { key: String },

    #[error("invalid output block inner id {id} in key {key}")]
    InvalidOutputBlock { key: String, id: usize },

    #[error("down-projection {key} has no matching up-projection")]
    MissingUpProjection { key: String },

    #[error("the following keys have not been correctly renamed: {}", .0.join(", "))]
    ResidualKeys(Vec<String>),

    #[error("alpha {key} must be a scalar, got shape {shape:?}")]
    InvalidAlpha { key: String, shape: Vec<usize> },

    #[error("invalid LoRA checkpoint: keys without a LoRA component: {}", .0.join(", "))]
    NotLora(Vec<String>),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// A checkpoint after normalization.
#[derive(Debug)]
pub struct NormalizedCheckpoint {
    /// Dialect the checkpoint was detected as.
    pub dialect: Dialect,
    /// Canonical key to tensor.
    pub state_dict: StateDict,
    /// Alphas keyed by `<canonical path>.alpha`.
    pub network_alphas: NetworkAlphas,
}

impl NormalizedCheckpoint {
    /// Whether keys carry target namespaces. Legacy checkpoints do not.
    pub fn is_prefixed(&self) -> bool {
        !matches!(self.dialect, Dialect::LegacyUnprefixed)
    }
}

/// Rewrite any supported dialect into canonical form.
///
/// `layers_per_block` comes from the target UNet's configuration and is only
/// consulted for SGM block numbering. The input map is consumed.
pub fn normalize(
    state_dict: StateDict,
    layers_per_block: Option<usize>,
) -> Result<NormalizedCheckpoint, ConvertError> {
    let dialect = detect_dialect(state_dict.keys().map(String::as_str))?;
    debug!(?dialect, keys = state_dict.len(), "normalizing LoRA checkpoint");

    let (state_dict, network_alphas) = match dialect {
        Dialect::SgmBlocks => {
            let layers_per_block = layers_per_block.ok_or(ConvertError::MissingLayersPerBlock)?;
            let remapped = map_sgm_blocks_to_diffusers(state_dict, layers_per_block)?;
            convert_kohya_to_diffusers(remapped)?
        }
        Dialect::Kohya => convert_kohya_to_diffusers(state_dict)?,
        Dialect::Canonical => split_embedded_alphas(state_dict)?,
        Dialect::LegacyUnprefixed => {
            warn!(
                "checkpoint keys carry no target prefix; all weights will be loaded into the UNet"
            );
            split_embedded_alphas(state_dict)?
        }
    };

    let mut invalid: Vec<String> = state_dict
        .keys()
        .filter(|k| !k.contains("lora"))
        .cloned()
        .collect();
    if !invalid.is_empty() {
        invalid.sort();
        return Err(ConvertError::NotLora(invalid));
    }

    Ok(NormalizedCheckpoint {
        dialect,
        state_dict,
        network_alphas,
    })
}

/// Move `<path>.alpha` scalars out of a canonical or legacy state dict.
fn split_embedded_alphas(mut state_dict: StateDict) -> Result<(StateDict, NetworkAlphas), ConvertError> {
    let alpha_keys: Vec<String> = state_dict
        .keys()
        .filter(|k| k.ends_with(".alpha"))
        .cloned()
        .collect();

    let mut alphas = NetworkAlphas::with_capacity(alpha_keys.len());
    for key in alpha_keys {
        if let Some(tensor) = state_dict.remove(&key) {
            alphas.insert(key.clone(), scalar_value(&key, &tensor)?);
        }
    }
    Ok((state_dict, alphas))
}

/// Read a single-element tensor as `f32`.
pub(crate) fn scalar_value(key: &str, tensor: &Tensor) -> Result<f32, ConvertError> {
    if tensor.elem_count() != 1 {
        return Err(ConvertError::InvalidAlpha {
            key: key.to_string(),
            shape: tensor.dims().to_vec(),
        });
    }
    let value = tensor
        .flatten_all()?
        .to_dtype(candle_core::DType::F32)?
        .to_vec1::<f32>()?;
    Ok(value[0])
}
