use candle_core::{Device, Tensor};

use super::tiny_networks::{HIDDEN, TIME_EMBED};
use crate::lora::StateDict;

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0.0f32, 0.1, shape, &Device::Cpu).expect("randn on cpu")
}

fn scalar(value: f32) -> Tensor {
    Tensor::new(value, &Device::Cpu).expect("scalar on cpu")
}

/// Insert `<module>.lora_A.weight` `[rank, in]` and `<module>.lora_B.weight` `[out, rank]`.
pub fn peft_pair(
    state_dict: &mut StateDict,
    module: &str,
    rank: usize,
    in_features: usize,
    out_features: usize,
) {
    state_dict.insert(format!("{module}.lora_A.weight"), randn(&[rank, in_features]));
    state_dict.insert(format!("{module}.lora_B.weight"), randn(&[out_features, rank]));
}

/// Insert a Kohya linear pair `<name>.lora_down.weight` / `<name>.lora_up.weight`
/// and, when given, `<name>.alpha`.
pub fn kohya_pair(
    state_dict: &mut StateDict,
    lora_name: &str,
    rank: usize,
    in_features: usize,
    out_features: usize,
    alpha: Option<f32>,
) {
    state_dict.insert(format!("{lora_name}.lora_down.weight"), randn(&[rank, in_features]));
    state_dict.insert(format!("{lora_name}.lora_up.weight"), randn(&[out_features, rank]));
    if let Some(alpha) = alpha {
        state_dict.insert(format!("{lora_name}.alpha"), scalar(alpha));
    }
}

/// Insert a Kohya 3x3 convolution pair.
pub fn kohya_conv_pair(
    state_dict: &mut StateDict,
    lora_name: &str,
    rank: usize,
    channels: usize,
    alpha: Option<f32>,
) {
    state_dict.insert(
        format!("{lora_name}.lora_down.weight"),
        randn(&[rank, channels, 3, 3]),
    );
    state_dict.insert(
        format!("{lora_name}.lora_up.weight"),
        randn(&[channels, rank, 1, 1]),
    );
    if let Some(alpha) = alpha {
        state_dict.insert(format!("{lora_name}.alpha"), scalar(alpha));
    }
}

/// A Kohya checkpoint matching the tiny UNet and the first tiny text encoder.
///
/// UNet: `proj_in`, `attn1.to_q`, `attn2.to_out.0`, `ff.net.2`, resnet
/// `conv1` and `time_emb_proj`. Text encoder: layer 0 `q_proj` and `mlp.fc1`.
/// Every pair has rank 4 and alpha 2.0.
pub fn tiny_kohya_checkpoint() -> StateDict {
    let mut sd = StateDict::new();
    let rank = 4;
    let alpha = Some(2.0);
    let block = "lora_unet_down_blocks_0_attentions_0";
    kohya_pair(&mut sd, &format!("{block}_proj_in"), rank, HIDDEN, HIDDEN, alpha);
    kohya_pair(
        &mut sd,
        &format!("{block}_transformer_blocks_0_attn1_to_q"),
        rank,
        HIDDEN,
        HIDDEN,
        alpha,
    );
    kohya_pair(
        &mut sd,
        &format!("{block}_transformer_blocks_0_attn2_to_out_0"),
        rank,
        HIDDEN,
        HIDDEN,
        alpha,
    );
    kohya_pair(
        &mut sd,
        &format!("{block}_transformer_blocks_0_ff_net_2"),
        rank,
        HIDDEN * 4,
        HIDDEN,
        alpha,
    );
    kohya_conv_pair(&mut sd, "lora_unet_down_blocks_0_resnets_0_conv1", rank, HIDDEN, alpha);
    kohya_pair(
        &mut sd,
        "lora_unet_down_blocks_0_resnets_0_time_emb_proj",
        rank,
        TIME_EMBED,
        HIDDEN,
        alpha,
    );
    kohya_pair(
        &mut sd,
        "lora_te_text_model_encoder_layers_0_self_attn_q_proj",
        rank,
        HIDDEN,
        HIDDEN,
        alpha,
    );
    kohya_pair(
        &mut sd,
        "lora_te_text_model_encoder_layers_0_mlp_fc1",
        rank,
        HIDDEN,
        HIDDEN * 2,
        alpha,
    );
    sd
}
