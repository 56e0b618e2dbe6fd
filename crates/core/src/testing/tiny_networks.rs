use candle_core::{DType, Device, Tensor};

use crate::lora::{LoraLoader, LoraManager, LoraManagerConfig, LoraNetwork, StateDict, TargetKind};

/// Channel width of the tiny UNet and hidden size of the tiny CLIP encoders.
pub const HIDDEN: usize = 8;
/// Width of the tiny UNet's time embedding.
pub const TIME_EMBED: usize = 16;

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0.0f32, 0.02, shape, &Device::Cpu).expect("randn on cpu")
}

fn zeros(len: usize) -> Tensor {
    Tensor::zeros(len, DType::F32, &Device::Cpu).expect("zeros on cpu")
}

fn insert_linear(weights: &mut StateDict, path: &str, in_features: usize, out_features: usize, bias: bool) {
    weights.insert(format!("{path}.weight"), randn(&[out_features, in_features]));
    if bias {
        weights.insert(format!("{path}.bias"), zeros(out_features));
    }
}

fn insert_attention(weights: &mut StateDict, block: &str) {
    for attn in ["attn1", "attn2"] {
        for proj in ["to_q", "to_k", "to_v"] {
            insert_linear(weights, &format!("{block}.{attn}.{proj}"), HIDDEN, HIDDEN, false);
        }
        insert_linear(weights, &format!("{block}.{attn}.to_out.0"), HIDDEN, HIDDEN, true);
    }
    insert_linear(weights, &format!("{block}.ff.net.0.proj"), HIDDEN, HIDDEN * 4, true);
    insert_linear(weights, &format!("{block}.ff.net.2"), HIDDEN * 4, HIDDEN, true);
    weights.insert(format!("{block}.norm1.weight"), zeros(HIDDEN));
}

/// A one-block UNet: attention and resnet layers under `down_blocks.0`,
/// plus a mid-block attention.
pub fn tiny_unet_network() -> LoraNetwork {
    let mut weights = StateDict::new();

    let attention = "down_blocks.0.attentions.0";
    insert_linear(&mut weights, &format!("{attention}.proj_in"), HIDDEN, HIDDEN, true);
    insert_linear(&mut weights, &format!("{attention}.proj_out"), HIDDEN, HIDDEN, true);
    insert_attention(&mut weights, &format!("{attention}.transformer_blocks.0"));

    let resnet = "down_blocks.0.resnets.0";
    for conv in ["conv1", "conv2"] {
        weights.insert(format!("{resnet}.{conv}.weight"), randn(&[HIDDEN, HIDDEN, 3, 3]));
        weights.insert(format!("{resnet}.{conv}.bias"), zeros(HIDDEN));
    }
    insert_linear(&mut weights, &format!("{resnet}.time_emb_proj"), TIME_EMBED, HIDDEN, true);

    let mid = "mid_block.attentions.0";
    insert_linear(&mut weights, &format!("{mid}.proj_in"), HIDDEN, HIDDEN, true);
    insert_linear(&mut weights, &format!("{mid}.proj_out"), HIDDEN, HIDDEN, true);
    insert_attention(&mut weights, &format!("{mid}.transformer_blocks.0"));

    LoraNetwork::from_state_dict(TargetKind::Unet, weights)
}

/// A CLIP text encoder with `num_layers` encoder layers.
pub fn tiny_clip_network(kind: TargetKind, num_layers: usize) -> LoraNetwork {
    let mut weights = StateDict::new();
    weights.insert(
        "text_model.embeddings.token_embedding.weight".to_string(),
        randn(&[32, HIDDEN]),
    );
    for i in 0..num_layers {
        let layer = format!("text_model.encoder.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            insert_linear(&mut weights, &format!("{layer}.self_attn.{proj}"), HIDDEN, HIDDEN, true);
        }
        insert_linear(&mut weights, &format!("{layer}.mlp.fc1"), HIDDEN, HIDDEN * 2, true);
        insert_linear(&mut weights, &format!("{layer}.mlp.fc2"), HIDDEN * 2, HIDDEN, true);
        weights.insert(format!("{layer}.layer_norm1.weight"), zeros(HIDDEN));
    }
    weights.insert("text_model.final_layer_norm.weight".to_string(), zeros(HIDDEN));
    LoraNetwork::from_state_dict(kind, weights)
}

/// A manager holding a tiny UNet and two tiny text encoders.
pub fn tiny_manager() -> LoraManager {
    LoraManager::new(
        LoraLoader::new(Device::Cpu, DType::F32),
        LoraManagerConfig::default(),
    )
    .with_network(tiny_unet_network())
    .with_network(tiny_clip_network(TargetKind::TextEncoder, 2))
    .with_network(tiny_clip_network(TargetKind::TextEncoder2, 2))
}
