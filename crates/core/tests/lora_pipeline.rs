//! Integration tests for the LoRA loading pipeline.
//!
//! Checkpoints are written to a temporary directory in the Kohya, SGM and
//! canonical dialects, then resolved, normalized and injected through
//! `LoraManager`. Everything runs on the CPU with tiny synthetic networks.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use difflora_core::config::UNetConfig;
use difflora_core::lora::{
    normalize, CheckpointSource, ConvertError, Dialect, FuseOptions, LoadOptions, LoraLoader,
    LoraManager, LoraManagerConfig, LoraManagerError, LoraNetwork, SaveOptions, StateDict,
    TargetKind, LORA_WEIGHT_NAME_SAFE,
};

const HIDDEN: usize = 8;
const RANK: usize = 4;

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0.0f32, 0.1, shape, &Device::Cpu).unwrap()
}

fn linear(weights: &mut StateDict, path: &str, in_features: usize, out_features: usize) {
    weights.insert(format!("{path}.weight"), randn(&[out_features, in_features]));
    weights.insert(
        format!("{path}.bias"),
        Tensor::zeros(out_features, DType::F32, &Device::Cpu).unwrap(),
    );
}

/// UNet with one down-block attention and one mid-block attention.
fn unet() -> LoraNetwork {
    let mut weights = StateDict::new();
    for block in ["down_blocks.0.attentions.0", "mid_block.attentions.0"] {
        linear(&mut weights, &format!("{block}.proj_in"), HIDDEN, HIDDEN);
        linear(&mut weights, &format!("{block}.proj_out"), HIDDEN, HIDDEN);
        for proj in ["to_q", "to_k", "to_v", "to_out.0"] {
            linear(
                &mut weights,
                &format!("{block}.transformer_blocks.0.attn1.{proj}"),
                HIDDEN,
                HIDDEN,
            );
        }
    }
    LoraNetwork::from_state_dict(TargetKind::Unet, weights)
}

/// Single-layer CLIP text encoder.
fn text_encoder(kind: TargetKind) -> LoraNetwork {
    let mut weights = StateDict::new();
    let layer = "text_model.encoder.layers.0";
    for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
        linear(&mut weights, &format!("{layer}.self_attn.{proj}"), HIDDEN, HIDDEN);
    }
    linear(&mut weights, &format!("{layer}.mlp.fc1"), HIDDEN, HIDDEN * 2);
    linear(&mut weights, &format!("{layer}.mlp.fc2"), HIDDEN * 2, HIDDEN);
    LoraNetwork::from_state_dict(kind, weights)
}

fn manager() -> LoraManager {
    LoraManager::with_defaults(Device::Cpu, DType::F32)
        .with_network(unet())
        .with_network(text_encoder(TargetKind::TextEncoder))
}

fn kohya_pair(sd: &mut StateDict, name: &str, in_features: usize, out_features: usize, alpha: f32) {
    sd.insert(format!("{name}.lora_down.weight"), randn(&[RANK, in_features]));
    sd.insert(format!("{name}.lora_up.weight"), randn(&[out_features, RANK]));
    sd.insert(
        format!("{name}.alpha"),
        Tensor::new(alpha, &Device::Cpu).unwrap(),
    );
}

fn kohya_checkpoint() -> StateDict {
    let mut sd = StateDict::new();
    kohya_pair(&mut sd, "lora_unet_down_blocks_0_attentions_0_proj_in", HIDDEN, HIDDEN, 4.0);
    kohya_pair(
        &mut sd,
        "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_k",
        HIDDEN,
        HIDDEN,
        4.0,
    );
    kohya_pair(
        &mut sd,
        "lora_te_text_model_encoder_layers_0_self_attn_out_proj",
        HIDDEN,
        HIDDEN,
        2.0,
    );
    kohya_pair(&mut sd, "lora_te_text_model_encoder_layers_0_mlp_fc2", HIDDEN * 2, HIDDEN, 2.0);
    sd
}

fn save(sd: &StateDict, dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    candle_core::safetensors::save(sd, &path).unwrap();
    path
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

// ─── Normalization ───────────────────────────────────────────────────────────

#[test]
fn test_kohya_normalizes_into_two_prefixed_partitions() {
    let normalized = normalize(kohya_checkpoint(), None).unwrap();
    assert_eq!(normalized.dialect, Dialect::Kohya);
    assert_eq!(normalized.state_dict.len(), 8);

    let unet = normalized
        .state_dict
        .keys()
        .filter(|k| k.starts_with("unet."))
        .count();
    let te = normalized
        .state_dict
        .keys()
        .filter(|k| k.starts_with("text_encoder."))
        .count();
    assert_eq!((unet, te), (4, 4));

    assert_eq!(normalized.network_alphas.len(), 4);
    assert_eq!(
        normalized
            .network_alphas
            .get("unet.down_blocks.0.attentions.0.proj_in.alpha"),
        Some(&4.0)
    );
    for (key, alpha) in &normalized.network_alphas {
        assert!(key.ends_with(".alpha"), "{key}");
        let expected = if key.starts_with("unet.") { 4.0 } else { 2.0 };
        assert_eq!(*alpha, expected, "{key}");
    }
}

#[test]
fn test_canonical_checkpoint_passes_through_unchanged() {
    let mut sd = StateDict::new();
    sd.insert(
        "unet.mid_block.attentions.0.proj_in.lora.down.weight".into(),
        randn(&[RANK, HIDDEN]),
    );
    sd.insert(
        "unet.mid_block.attentions.0.proj_in.lora.up.weight".into(),
        randn(&[HIDDEN, RANK]),
    );
    let keys: Vec<String> = {
        let mut keys: Vec<String> = sd.keys().cloned().collect();
        keys.sort();
        keys
    };

    let normalized = normalize(sd, Some(2)).unwrap();
    assert_eq!(normalized.dialect, Dialect::Canonical);
    let mut out: Vec<String> = normalized.state_dict.into_keys().collect();
    out.sort();
    assert_eq!(out, keys);
    assert!(normalized.network_alphas.is_empty());
}

#[test]
fn test_non_lora_checkpoint_is_rejected() {
    let mut sd = StateDict::new();
    sd.insert("unet.mid_block.proj_in.weight".into(), randn(&[HIDDEN, HIDDEN]));
    let err = normalize(sd, None).unwrap_err();
    assert!(matches!(err, ConvertError::NotLora(keys) if keys.len() == 1));
}

// ─── Loading through the manager ─────────────────────────────────────────────

#[test]
fn test_kohya_checkpoint_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    save(&kohya_checkpoint(), dir.path(), "my_style.safetensors");

    let mut manager = manager();
    let summary = manager
        .load_lora_weights(dir.path(), &LoadOptions::default().with_adapter_name("style"))
        .unwrap();

    assert_eq!(summary.dialect, Dialect::Kohya);
    assert_eq!(summary.targets[&TargetKind::Unet].layers, 2);
    assert_eq!(summary.targets[&TargetKind::TextEncoder].layers, 2);
    assert!(summary
        .targets
        .values()
        .all(|r| r.unexpected_keys.is_empty()));

    let te = manager.network(TargetKind::TextEncoder).unwrap();
    let adapter = te
        .layer("text_model.encoder.layers.0.self_attn.out_proj")
        .unwrap()
        .adapter("style")
        .unwrap();
    assert_eq!(adapter.alpha, Some(2.0));
    assert_eq!(adapter.rank, RANK);

    let unet = manager.network(TargetKind::Unet).unwrap();
    assert!(unet
        .layer("down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_k")
        .unwrap()
        .has_adapter("style"));
    assert_eq!(manager.get_active_adapters().unwrap(), vec!["style".to_string()]);
}

#[test]
fn test_sgm_checkpoint_uses_layers_per_block() {
    let mut sd = StateDict::new();
    // layers_per_block = 2: input block 1 is down_blocks.0, layer 0
    kohya_pair(&mut sd, "lora_unet_input_blocks_1_1_proj_in", HIDDEN, HIDDEN, 4.0);
    kohya_pair(&mut sd, "lora_unet_middle_block_1_proj_out", HIDDEN, HIDDEN, 4.0);

    let mut manager = LoraManager::new(
        LoraLoader::new(Device::Cpu, DType::F32),
        LoraManagerConfig {
            unet_config: UNetConfig::default().with_layers_per_block(2),
            ..LoraManagerConfig::default()
        },
    )
    .with_network(unet());

    let summary = manager
        .load_lora_weights(sd.clone(), &LoadOptions::default())
        .unwrap();
    assert_eq!(summary.dialect, Dialect::SgmBlocks);
    assert_eq!(summary.layers(), 2);
    let unet = manager.network(TargetKind::Unet).unwrap();
    assert!(unet
        .layer("down_blocks.0.attentions.0.proj_in")
        .unwrap()
        .has_adapter("default_0"));
    assert!(unet
        .layer("mid_block.attentions.0.proj_out")
        .unwrap()
        .has_adapter("default_0"));

    assert!(matches!(
        normalize(sd, None),
        Err(ConvertError::MissingLayersPerBlock)
    ));
}

#[test]
fn test_ambiguous_directory_is_rejected_before_any_mutation() {
    let dir = tempfile::tempdir().unwrap();
    save(&kohya_checkpoint(), dir.path(), "a.safetensors");
    save(&kohya_checkpoint(), dir.path(), "b.safetensors");

    let mut manager = manager();
    let err = manager
        .load_lora_weights(dir.path(), &LoadOptions::default())
        .unwrap_err();
    assert!(matches!(err, LoraManagerError::LoadError(_)));
    assert!(err.to_string().contains("a.safetensors"));
    assert!(manager.get_list_adapters().is_empty());

    manager
        .load_lora_weights(
            dir.path(),
            &LoadOptions::default().with_weight_name("b.safetensors"),
        )
        .unwrap();
    assert_eq!(manager.get_list_adapters().len(), 2);
}

#[test]
fn test_legacy_unprefixed_checkpoint_goes_to_unet() {
    let mut sd = StateDict::new();
    sd.insert(
        "down_blocks.0.attentions.0.proj_out.lora.down.weight".into(),
        randn(&[RANK, HIDDEN]),
    );
    sd.insert(
        "down_blocks.0.attentions.0.proj_out.lora.up.weight".into(),
        randn(&[HIDDEN, RANK]),
    );

    let mut manager = manager();
    let summary = manager
        .load_lora_weights(CheckpointSource::StateDict(sd), &LoadOptions::default())
        .unwrap();
    assert_eq!(summary.dialect, Dialect::LegacyUnprefixed);
    assert_eq!(summary.targets.keys().copied().collect::<Vec<_>>(), vec![TargetKind::Unet]);
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[test]
fn test_fuse_unfuse_round_trip_restores_weights() {
    let mut manager = manager();
    manager
        .load_lora_weights(kohya_checkpoint(), &LoadOptions::default())
        .unwrap();

    let path = "down_blocks.0.attentions.0.proj_in";
    let before = manager
        .network(TargetKind::Unet)
        .unwrap()
        .layer(path)
        .unwrap()
        .weight()
        .clone();

    let options = FuseOptions {
        lora_scale: 0.7,
        safe_fusing: true,
        ..FuseOptions::default()
    };
    let summary = manager.fuse_lora(&options).unwrap();
    assert!(summary.skipped_layers().is_empty());

    let fused = manager
        .network(TargetKind::Unet)
        .unwrap()
        .layer(path)
        .unwrap()
        .weight()
        .clone();
    assert!(max_abs_diff(&before, &fused) > 0.0);

    manager.unfuse_lora(true, true).unwrap();
    let after = manager
        .network(TargetKind::Unet)
        .unwrap()
        .layer(path)
        .unwrap()
        .weight()
        .clone();
    assert!(max_abs_diff(&before, &after) < 1e-5);
}

#[test]
fn test_saved_adapter_reloads_with_alphas() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager();
    manager
        .load_lora_weights(kohya_checkpoint(), &LoadOptions::default().with_adapter_name("k"))
        .unwrap();

    let path = manager
        .save_adapter("k", dir.path(), &SaveOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(path, dir.path().join(LORA_WEIGHT_NAME_SAFE));

    let mut fresh = self::manager();
    let summary = fresh
        .load_lora_weights(dir.path(), &LoadOptions::default().with_adapter_name("copy"))
        .unwrap();
    assert_eq!(summary.dialect, Dialect::Canonical);
    assert_eq!(summary.layers(), 4);

    let scales: HashMap<TargetKind, f32> = [TargetKind::Unet, TargetKind::TextEncoder]
        .into_iter()
        .map(|kind| {
            let network = fresh.network(kind).unwrap();
            let (_, layer) = network
                .layers()
                .find(|(_, l)| l.has_adapter("copy"))
                .unwrap();
            (kind, layer.adapter("copy").unwrap().scale)
        })
        .collect();
    // alpha / rank
    assert!((scales[&TargetKind::Unet] - 1.0).abs() < f32::EPSILON);
    assert!((scales[&TargetKind::TextEncoder] - 0.5).abs() < f32::EPSILON);
}

#[test]
fn test_save_skipped_on_non_main_process() {
    let dir = tempfile::tempdir().unwrap();
    let mut layers = StateDict::new();
    layers.insert("mid_block.proj_in.lora_A.weight".into(), randn(&[RANK, HIDDEN]));
    let options = SaveOptions {
        is_main_process: false,
        ..SaveOptions::default()
    };
    let written = LoraManager::save_lora_weights(dir.path(), Some(layers), None, None, &options)
        .unwrap();
    assert!(written.is_none());
    assert!(!dir.path().join(LORA_WEIGHT_NAME_SAFE).exists());
}
