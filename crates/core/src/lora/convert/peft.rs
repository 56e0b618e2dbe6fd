//! Canonical to PEFT key conversion (`<module>.lora_A.weight` / `<module>.lora_B.weight`).

use std::collections::{BTreeMap, BTreeSet, HashSet};

use candle_core::Tensor;

use super::{scalar_value, ConvertError};
use crate::lora::types::{LoraComponent, StateDict, TargetKind};

const UNET_RULES: [(&str, &str); 8] = [
    (".to_q_lora.down.", ".to_q.lora_A."),
    (".to_q_lora.up.", ".to_q.lora_B."),
    (".to_k_lora.down.", ".to_k.lora_A."),
    (".to_k_lora.up.", ".to_k.lora_B."),
    (".to_v_lora.down.", ".to_v.lora_A."),
    (".to_v_lora.up.", ".to_v.lora_B."),
    (".to_out_lora.down.", ".to_out.0.lora_A."),
    (".to_out_lora.up.", ".to_out.0.lora_B."),
];

const TEXT_ENCODER_RULES: [(&str, &str); 8] = [
    (".to_q_lora.down.", ".q_proj.lora_A."),
    (".to_q_lora.up.", ".q_proj.lora_B."),
    (".to_k_lora.down.", ".k_proj.lora_A."),
    (".to_k_lora.up.", ".k_proj.lora_B."),
    (".to_v_lora.down.", ".v_proj.lora_A."),
    (".to_v_lora.up.", ".v_proj.lora_B."),
    (".to_out_lora.down.", ".out_proj.lora_A."),
    (".to_out_lora.up.", ".out_proj.lora_B."),
];

const COMMON_RULES: [(&str, &str); 6] = [
    (".lora_linear_layer.down.", ".lora_A."),
    (".lora_linear_layer.up.", ".lora_B."),
    (".lora.down.", ".lora_A."),
    (".lora.up.", ".lora_B."),
    (".lora_a.", ".lora_A."),
    (".lora_b.", ".lora_B."),
];

/// Rewrite one canonical key (target prefix already removed) into PEFT form.
/// Keys already in PEFT form come back unchanged.
pub fn to_peft_key(key: &str, target: TargetKind) -> String {
    let mut key = key.replace(".processor.", ".");
    let target_rules = match target {
        TargetKind::Unet => &UNET_RULES,
        TargetKind::TextEncoder | TargetKind::TextEncoder2 => &TEXT_ENCODER_RULES,
    };
    for (from, to) in target_rules.iter().chain(COMMON_RULES.iter()) {
        if key.contains(from) {
            key = key.replace(from, to);
        }
    }
    key
}

/// Rewrite every key of a target partition into PEFT form.
pub fn convert_state_dict_to_peft(state_dict: StateDict, target: TargetKind) -> StateDict {
    state_dict
        .into_iter()
        .map(|(key, tensor)| (to_peft_key(&key, target), tensor))
        .collect()
}

/// Split a PEFT key into its module path and component.
///
/// ```text
/// down_blocks.0.attentions.0.proj_in.lora_A.weight -> (down_blocks.0.attentions.0.proj_in, Down)
/// text_model.encoder.layers.0.self_attn.q_proj.alpha -> (text_model.encoder.layers.0.self_attn.q_proj, Alpha)
/// ```
pub fn split_peft_key(key: &str) -> Option<(String, LoraComponent)> {
    let key = key.strip_prefix("base_model.model.").unwrap_or(key);
    if let Some(module) = key.strip_suffix(".alpha") {
        return Some((module.to_string(), LoraComponent::Alpha));
    }
    let key = key.strip_suffix(".weight").unwrap_or(key);
    if let Some(module) = key.strip_suffix(".lora_A") {
        Some((module.to_string(), LoraComponent::Down))
    } else {
        key.strip_suffix(".lora_B")
            .map(|module| (module.to_string(), LoraComponent::Up))
    }
}

/// Fail on the first module (in key order) that has a down-projection but
/// no up-projection. Keys are PEFT-form with the target prefix removed.
pub fn require_up_projections(target: TargetKind, state_dict: &StateDict) -> Result<(), ConvertError> {
    let mut downs = BTreeSet::new();
    let mut ups = HashSet::new();
    for key in state_dict.keys() {
        match split_peft_key(key) {
            Some((module, LoraComponent::Down)) => {
                downs.insert(module);
            }
            Some((module, LoraComponent::Up)) => {
                ups.insert(module);
            }
            _ => {}
        }
    }
    match downs.into_iter().find(|module| !ups.contains(module)) {
        Some(module) => Err(ConvertError::MissingUpProjection {
            key: format!("{}{module}.lora_A.weight", target.prefix()),
        }),
        None => Ok(()),
    }
}

/// Module path an alpha key refers to. Accepts `<module>.alpha` as well as
/// alphas named after a down-projection (`...to_q_lora.down.weight.alpha`).
pub fn alpha_module_path(key: &str, target: TargetKind) -> String {
    let stem = key.strip_suffix(".alpha").unwrap_or(key);
    let peft = to_peft_key(stem, target);
    match split_peft_key(&peft) {
        Some((module, _)) => module,
        None => peft,
    }
}

/// Low-rank pair of one module, as grouped from a PEFT state dict.
#[derive(Debug, Default)]
pub struct GroupedWeights {
    pub down: Option<Tensor>,
    pub up: Option<Tensor>,
    pub alpha: Option<f32>,
}

impl GroupedWeights {
    pub fn is_complete(&self) -> bool {
        self.down.is_some() && self.up.is_some()
    }
}

/// Group PEFT weights by module path.
///
/// Returns the groups and the keys that do not name a LoRA component.
pub fn group_by_module(
    state_dict: StateDict,
) -> Result<(BTreeMap<String, GroupedWeights>, Vec<String>), ConvertError> {
    let mut groups: BTreeMap<String, GroupedWeights> = BTreeMap::new();
    let mut unrecognized = Vec::new();

    for (key, tensor) in state_dict {
        match split_peft_key(&key) {
            Some((module, LoraComponent::Down)) => groups.entry(module).or_default().down = Some(tensor),
            Some((module, LoraComponent::Up)) => groups.entry(module).or_default().up = Some(tensor),
            Some((module, LoraComponent::Alpha)) => {
                let value = scalar_value(&key, &tensor)?;
                groups.entry(module).or_default().alpha = Some(value);
            }
            None => unrecognized.push(key),
        }
    }
    unrecognized.sort();
    Ok((groups, unrecognized))
}
