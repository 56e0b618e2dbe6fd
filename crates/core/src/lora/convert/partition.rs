//! Splitting a normalized checkpoint into per-target PEFT partitions.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};

use super::peft::{alpha_module_path, convert_state_dict_to_peft, require_up_projections};
use super::{ConvertError, NormalizedCheckpoint};
use crate::lora::types::{StateDict, TargetKind};

/// One target's share of a checkpoint: PEFT keys with the target prefix
/// removed, and alphas keyed by module path.
#[derive(Debug, Default)]
pub struct TargetPartition {
    pub state_dict: StateDict,
    pub alphas: HashMap<String, f32>,
}

impl TargetPartition {
    /// Number of distinct modules with a down-projection.
    pub fn num_modules(&self) -> usize {
        self.state_dict
            .keys()
            .filter(|k| k.ends_with(".lora_A.weight"))
            .count()
    }

    /// State dict with every alpha stored back as a `<module>.alpha` scalar.
    pub fn with_embedded_alphas(self) -> candle_core::Result<StateDict> {
        let device = self
            .state_dict
            .values()
            .next()
            .map(|t| t.device().clone())
            .unwrap_or(Device::Cpu);
        let mut state_dict = self.state_dict;
        for (module, alpha) in self.alphas {
            state_dict.insert(format!("{module}.alpha"), Tensor::new(alpha, &device)?);
        }
        Ok(state_dict)
    }
}

/// Split a normalized checkpoint by target, rewriting keys into PEFT form.
/// Unprefixed checkpoints go entirely to the UNet.
pub fn partition_by_target(
    checkpoint: NormalizedCheckpoint,
) -> Result<BTreeMap<TargetKind, TargetPartition>, ConvertError> {
    let prefixed = checkpoint.is_prefixed();
    let classify = |key: &str| -> Result<(TargetKind, String), ConvertError> {
        if !prefixed {
            return Ok((TargetKind::Unet, key.to_string()));
        }
        let kind = TargetKind::from_key(key).ok_or_else(|| ConvertError::UnsupportedLayer {
            key: key.to_string(),
        })?;
        let rest = kind.strip(key).unwrap_or(key);
        Ok((kind, rest.to_string()))
    };

    let mut raw: BTreeMap<TargetKind, StateDict> = BTreeMap::new();
    for (key, tensor) in checkpoint.state_dict {
        let (kind, rest) = classify(&key)?;
        raw.entry(kind).or_default().insert(rest, tensor);
    }

    let mut partitions: BTreeMap<TargetKind, TargetPartition> = BTreeMap::new();
    for (kind, state_dict) in raw {
        let state_dict = convert_state_dict_to_peft(state_dict, kind);
        require_up_projections(kind, &state_dict)?;
        partitions.insert(
            kind,
            TargetPartition {
                state_dict,
                alphas: HashMap::new(),
            },
        );
    }

    for (key, alpha) in checkpoint.network_alphas {
        let (kind, rest) = classify(&key)?;
        if let Some(partition) = partitions.get_mut(&kind) {
            partition.alphas.insert(alpha_module_path(&rest, kind), alpha);
        }
    }
    Ok(partitions)
}
