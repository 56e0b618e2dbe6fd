//! SGM (`input_blocks` / `middle_block` / `output_blocks`) block remapping.
//!
//! SGM-style checkpoints number UNet blocks linearly. With
//! `layers_per_block = L`, input block `i` lives at
//! `down_blocks[(i - 1) / (L + 1)]`, layer `(i - 1) % (L + 1)`, and output
//! block `i` at `up_blocks[i / (L + 1)]`, layer `i % (L + 1)`.

use super::ConvertError;
use crate::lora::types::StateDict;

const DELIMITER: &str = "_";
/// Index of the segment after the block id (`lora_unet_input_blocks_<id>_<inner>`).
const BLOCK_SLICE_POS: usize = 5;
const INNER_BLOCK_MAP: [&str; 3] = ["resnets", "attentions", "upsamplers"];
const SGM_PATTERNS: [&str; 3] = ["input_blocks", "middle_block", "output_blocks"];

#[derive(Debug, Clone, Copy)]
enum SgmBlock {
    Input,
    Middle,
    Output,
}

pub fn is_sgm_key(key: &str) -> bool {
    SGM_PATTERNS.iter().any(|p| key.contains(p))
}

/// Rewrite SGM block numbering into diffusers block/layer numbering.
///
/// Keys containing `text` pass through untouched. A map with no SGM keys
/// is returned as is.
pub fn map_sgm_blocks_to_diffusers(
    mut state_dict: StateDict,
    layers_per_block: usize,
) -> Result<StateDict, ConvertError> {
    if !state_dict.keys().any(|k| is_sgm_key(k)) {
        return Ok(state_dict);
    }

    let mut keys: Vec<String> = state_dict.keys().cloned().collect();
    keys.sort();

    let mut remapped = StateDict::with_capacity(keys.len());
    for key in keys {
        let new_key = if key.contains("text") {
            key.clone()
        } else {
            remap_key(&key, layers_per_block)?
        };
        if let Some(tensor) = state_dict.remove(&key) {
            remapped.insert(new_key, tensor);
        }
    }
    Ok(remapped)
}

fn remap_key(key: &str, layers_per_block: usize) -> Result<String, ConvertError> {
    let block = if key.contains(SGM_PATTERNS[0]) {
        SgmBlock::Input
    } else if key.contains(SGM_PATTERNS[1]) {
        SgmBlock::Middle
    } else if key.contains(SGM_PATTERNS[2]) {
        SgmBlock::Output
    } else {
        return Err(ConvertError::UnsupportedLayer {
            key: key.to_string(),
        });
    };

    let segments: Vec<&str> = key.split(DELIMITER).collect();
    let layer_id = parse_index(key, &segments, BLOCK_SLICE_POS - 1)?;
    let stride = layers_per_block + 1;

    let mut parts: Vec<String> = segments
        .iter()
        .take(BLOCK_SLICE_POS - 1)
        .map(|s| s.to_string())
        .collect();

    let tail_start = match block {
        SgmBlock::Input => {
            if layer_id == 0 {
                return Err(ConvertError::InvalidInputBlock {
                    key: key.to_string(),
                });
            }
            let block_id = (layer_id - 1) / stride;
            let layer_in_block = (layer_id - 1) % stride;
            let inner_id = parse_index(key, &segments, BLOCK_SLICE_POS)?;

            let is_downsampler = segments
                .get(BLOCK_SLICE_POS + 1)
                .is_some_and(|s| s.split('.').next() == Some("op"));
            let (inner_key, layer) = if is_downsampler {
                ("downsamplers", 0)
            } else {
                let inner_key = INNER_BLOCK_MAP.get(inner_id).ok_or_else(|| {
                    ConvertError::InvalidBlockId {
                        key: key.to_string(),
                        id: inner_id.to_string(),
                    }
                })?;
                (*inner_key, layer_in_block)
            };
            parts.extend([block_id.to_string(), inner_key.to_string(), layer.to_string()]);
            BLOCK_SLICE_POS + 1
        }
        SgmBlock::Middle => {
            let (inner_key, layer) = match layer_id {
                0 => (INNER_BLOCK_MAP[0], "0"),
                1 => (INNER_BLOCK_MAP[1], "0"),
                2 => (INNER_BLOCK_MAP[0], "1"),
                id => {
                    return Err(ConvertError::InvalidMiddleBlock {
                        key: key.to_string(),
                        id,
                    })
                }
            };
            parts.extend([inner_key.to_string(), layer.to_string()]);
            BLOCK_SLICE_POS
        }
        SgmBlock::Output => {
            let block_id = layer_id / stride;
            let layer_in_block = layer_id % stride;
            let inner_id = parse_index(key, &segments, BLOCK_SLICE_POS)?;
            let inner_key =
                INNER_BLOCK_MAP
                    .get(inner_id)
                    .ok_or_else(|| ConvertError::InvalidOutputBlock {
                        key: key.to_string(),
                        id: inner_id,
                    })?;
            let layer = if inner_id < 2 { layer_in_block } else { 0 };
            parts.extend([block_id.to_string(), inner_key.to_string(), layer.to_string()]);
            BLOCK_SLICE_POS + 1
        }
    };

    parts.extend(
        segments
            .get(tail_start..)
            .unwrap_or(&[])
            .iter()
            .map(|s| s.to_string()),
    );
    Ok(parts.join(DELIMITER))
}

fn parse_index(key: &str, segments: &[&str], pos: usize) -> Result<usize, ConvertError> {
    let raw = segments.get(pos).copied().unwrap_or_default();
    raw.parse().map_err(|_| ConvertError::InvalidBlockId {
        key: key.to_string(),
        id: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn state_dict(keys: &[&str]) -> StateDict {
        keys.iter()
            .map(|k| {
                (
                    k.to_string(),
                    Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_input_block_arithmetic() {
        // layers_per_block = 2 -> stride 3
        assert_eq!(
            remap_key("lora_unet_input_blocks_1_0_in_layers_2.lora_down.weight", 2).unwrap(),
            "lora_unet_input_blocks_0_resnets_0_in_layers_2.lora_down.weight"
        );
        assert_eq!(
            remap_key("lora_unet_input_blocks_2_1_proj_in.lora_down.weight", 2).unwrap(),
            "lora_unet_input_blocks_0_attentions_1_proj_in.lora_down.weight"
        );
        assert_eq!(
            remap_key("lora_unet_input_blocks_4_1_proj_in.lora_down.weight", 2).unwrap(),
            "lora_unet_input_blocks_1_attentions_0_proj_in.lora_down.weight"
        );
    }

    #[test]
    fn test_input_downsampler() {
        assert_eq!(
            remap_key("lora_unet_input_blocks_3_0_op.lora_down.weight", 2).unwrap(),
            "lora_unet_input_blocks_0_downsamplers_0_op.lora_down.weight"
        );
    }

    #[test]
    fn test_input_block_zero_is_invalid() {
        let err = remap_key("lora_unet_input_blocks_0_0_proj_in.lora_down.weight", 2).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidInputBlock { .. }));
    }

    #[test]
    fn test_middle_block_mapping() {
        assert_eq!(
            remap_key("lora_unet_middle_block_0_in_layers_2.lora_down.weight", 2).unwrap(),
            "lora_unet_middle_block_resnets_0_in_layers_2.lora_down.weight"
        );
        assert_eq!(
            remap_key(
                "lora_unet_middle_block_1_transformer_blocks_0_attn1_to_q.lora_down.weight",
                2
            )
            .unwrap(),
            "lora_unet_middle_block_attentions_0_transformer_blocks_0_attn1_to_q.lora_down.weight"
        );
        assert_eq!(
            remap_key("lora_unet_middle_block_2_out_layers_3.lora_up.weight", 2).unwrap(),
            "lora_unet_middle_block_resnets_1_out_layers_3.lora_up.weight"
        );

        let err = remap_key("lora_unet_middle_block_3_proj_in.lora_down.weight", 2).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidMiddleBlock { id: 3, .. }));
    }

    #[test]
    fn test_output_block_arithmetic() {
        assert_eq!(
            remap_key("lora_unet_output_blocks_5_1_proj_out.lora_down.weight", 2).unwrap(),
            "lora_unet_output_blocks_1_attentions_2_proj_out.lora_down.weight"
        );
        // upsamplers always land on layer 0
        assert_eq!(
            remap_key("lora_unet_output_blocks_2_2_conv.lora_down.weight", 2).unwrap(),
            "lora_unet_output_blocks_0_upsamplers_0_conv.lora_down.weight"
        );
        let err = remap_key("lora_unet_output_blocks_2_3_conv.lora_down.weight", 2).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidOutputBlock { id: 3, .. }));
    }

    #[test]
    fn test_unknown_unet_layer_is_unsupported() {
        let sd = state_dict(&[
            "lora_unet_input_blocks_1_0_in_layers_2.lora_down.weight",
            "lora_unet_time_embed_0.lora_down.weight",
        ]);
        let err = map_sgm_blocks_to_diffusers(sd, 2).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedLayer { .. }));
    }

    #[test]
    fn test_text_keys_pass_through() {
        let sd = state_dict(&[
            "lora_unet_input_blocks_1_0_in_layers_2.lora_down.weight",
            "lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_down.weight",
        ]);
        let remapped = map_sgm_blocks_to_diffusers(sd, 2).unwrap();
        assert_eq!(remapped.len(), 2);
        assert!(remapped.contains_key("lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_down.weight"));
        assert!(remapped.contains_key("lora_unet_input_blocks_0_resnets_0_in_layers_2.lora_down.weight"));
    }

    #[test]
    fn test_non_sgm_is_unchanged() {
        let sd = state_dict(&["lora_unet_down_blocks_0_attentions_0_proj_in.lora_down.weight"]);
        let remapped = map_sgm_blocks_to_diffusers(sd, 2).unwrap();
        assert!(remapped.contains_key("lora_unet_down_blocks_0_attentions_0_proj_in.lora_down.weight"));
    }

    #[test]
    fn test_canonical_checkpoint_passes_through() {
        let keys = [
            "unet.down_blocks.0.attentions.0.proj_in.lora.down.weight",
            "unet.down_blocks.0.attentions.0.proj_in.lora.up.weight",
            "unet.mid_block.attentions.0.transformer_blocks.0.attn1.processor.to_q_lora.down.weight",
            "unet.up_blocks.1.resnets.2.conv1.lora_A.weight",
            "text_encoder.text_model.encoder.layers.0.self_attn.to_k_lora.up.weight",
            "text_encoder_2.text_model.encoder.layers.3.mlp.fc1.lora_linear_layer.down.weight",
        ];
        let sd: StateDict = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let values = vec![i as f32; 4];
                (k.to_string(), Tensor::from_vec(values, 4, &Device::Cpu).unwrap())
            })
            .collect();

        let remapped = map_sgm_blocks_to_diffusers(sd.clone(), 2).unwrap();
        assert_eq!(remapped.len(), sd.len());
        for (key, tensor) in &sd {
            let out = remapped.get(key).unwrap_or_else(|| panic!("missing {key}"));
            assert_eq!(
                out.to_vec1::<f32>().unwrap(),
                tensor.to_vec1::<f32>().unwrap()
            );
        }
    }
}
