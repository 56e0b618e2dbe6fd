//! Kohya (`lora_unet_*`, `lora_te*_*`) key conversion.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use super::{scalar_value, ConvertError};
use crate::lora::types::{NetworkAlphas, StateDict, TargetKind};

/// Kohya prefixes and the target each one feeds. `lora_te_` is the
/// single-encoder spelling of `lora_te1_`.
const KOHYA_PREFIXES: [(&str, TargetKind); 4] = [
    ("lora_unet_", TargetKind::Unet),
    ("lora_te1_", TargetKind::TextEncoder),
    ("lora_te2_", TargetKind::TextEncoder2),
    ("lora_te_", TargetKind::TextEncoder),
];

/// Last `.N` segment with no further digits after it.
static TRAILING_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*)\.\d+(\D*)$").expect("trailing index pattern is valid")
});

pub fn is_kohya_key(key: &str) -> bool {
    split_kohya_prefix(key).is_some()
}

fn split_kohya_prefix(key: &str) -> Option<(TargetKind, &str)> {
    KOHYA_PREFIXES
        .iter()
        .find_map(|(prefix, target)| key.strip_prefix(prefix).map(|rest| (*target, rest)))
}

/// Convert a Kohya checkpoint into canonical keys plus alphas.
///
/// Each `<name>.lora_down.weight` is paired with `<name>.lora_up.weight`
/// and an optional `<name>.alpha`. Keys left over after conversion are an
/// error. Input that is not Kohya-style is returned unchanged.
pub fn convert_kohya_to_diffusers(
    mut state_dict: StateDict,
) -> Result<(StateDict, NetworkAlphas), ConvertError> {
    if state_dict.is_empty() || !state_dict.keys().all(|k| is_kohya_key(k)) {
        return Ok((state_dict, NetworkAlphas::new()));
    }

    let mut down_keys: Vec<String> = state_dict
        .keys()
        .filter(|k| k.ends_with("lora_down.weight"))
        .cloned()
        .collect();
    down_keys.sort();

    let mut converted = StateDict::with_capacity(state_dict.len());
    let mut alphas = NetworkAlphas::new();

    for key in down_keys {
        let lora_name = key.split('.').next().unwrap_or(&key).to_string();
        let up_key = format!("{lora_name}.lora_up.weight");
        let alpha_key = format!("{lora_name}.alpha");

        let Some((target, rest)) = split_kohya_prefix(&key) else {
            continue;
        };
        let flat = rest.replace('_', ".");
        let (diffusers_name, placed) = match target {
            TargetKind::Unet => (unet_name(&flat), true),
            _ => text_encoder_name(&flat),
        };

        if placed {
            let up = state_dict
                .remove(&up_key)
                .ok_or_else(|| ConvertError::MissingUpProjection { key: key.clone() })?;
            if let Some(down) = state_dict.remove(&key) {
                let prefix = target.prefix();
                converted.insert(format!("{prefix}{}", diffusers_name.replace(".down.", ".up.")), up);
                converted.insert(format!("{prefix}{diffusers_name}"), down);
            }
        }

        if let Some(alpha) = state_dict.remove(&alpha_key) {
            let value = scalar_value(&alpha_key, &alpha)?;
            let stem = diffusers_name
                .split(".lora.")
                .next()
                .unwrap_or(&diffusers_name);
            alphas.insert(format!("{}{stem}.alpha", target.prefix()), value);
        }
    }

    if !state_dict.is_empty() {
        let mut residual: Vec<String> = state_dict.into_keys().collect();
        residual.sort();
        return Err(ConvertError::ResidualKeys(residual));
    }

    info!("Kohya-style checkpoint detected");
    Ok((converted, alphas))
}

/// Map a dotted Kohya UNet name to its diffusers module path.
fn unet_name(flat: &str) -> String {
    let mut name = flat.to_string();

    name = if name.contains("input.blocks") {
        name.replace("input.blocks", "down_blocks")
    } else {
        name.replace("down.blocks", "down_blocks")
    };
    name = if name.contains("middle.block") {
        name.replace("middle.block", "mid_block")
    } else {
        name.replace("mid.block", "mid_block")
    };
    name = if name.contains("output.blocks") {
        name.replace("output.blocks", "up_blocks")
    } else {
        name.replace("up.blocks", "up_blocks")
    };

    for (from, to) in [
        ("transformer.blocks", "transformer_blocks"),
        ("to.q.lora", "to_q_lora"),
        ("to.k.lora", "to_k_lora"),
        ("to.v.lora", "to_v_lora"),
        ("to.out.0.lora", "to_out_lora"),
        ("proj.in", "proj_in"),
        ("proj.out", "proj_out"),
        ("emb.layers", "time_emb_proj"),
    ] {
        name = name.replace(from, to);
    }

    if name.contains("emb") && !name.contains("time.emb.proj") {
        name = TRAILING_INDEX.replace(&name, "${1}${2}").into_owned();
    }
    if name.contains(".in.") {
        name = name.replace("in.layers.2", "conv1");
    }
    if name.contains(".out.") {
        name = name.replace("out.layers.3", "conv2");
    }
    if name.contains("downsamplers") || name.contains("upsamplers") {
        name = name.replace("op", "conv");
    }
    if name.contains("skip") {
        name = name.replace("skip.connection", "conv_shortcut");
    }
    if name.contains("time.emb.proj") {
        name = name.replace("time.emb.proj", "time_emb_proj");
    }
    if name.contains("conv.shortcut") {
        name = name.replace("conv.shortcut", "conv_shortcut");
    }

    if name.contains("transformer_blocks") {
        if name.contains("attn1") {
            name = name.replace("attn1", "attn1.processor");
        } else if name.contains("attn2") {
            name = name.replace("attn2", "attn2.processor");
        }
    }
    name
}

/// Map a dotted Kohya text-encoder name. The flag is false for modules
/// outside self-attention and MLP blocks, which stay unconverted.
fn text_encoder_name(flat: &str) -> (String, bool) {
    let mut name = flat.to_string();
    for (from, to) in [
        ("text.model", "text_model"),
        ("self.attn", "self_attn"),
        ("q.proj.lora", "to_q_lora"),
        ("k.proj.lora", "to_k_lora"),
        ("v.proj.lora", "to_v_lora"),
        ("out.proj.lora", "to_out_lora"),
    ] {
        name = name.replace(from, to);
    }

    if name.contains("self_attn") {
        (name, true)
    } else if name.contains("mlp") {
        (name.replace(".lora.", ".lora_linear_layer."), true)
    } else {
        (name, false)
    }
}
