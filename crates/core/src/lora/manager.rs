//! Pipeline-level LoRA management.
//!
//! [`LoraManager`] owns the UNet and up to two text encoders and drives the
//! whole adapter lifecycle over them: resolve and normalize a checkpoint,
//! inject it into every target, activate, fuse, unfuse, delete, unload and
//! save.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use thiserror::Error;
use tracing::{info, warn};

use super::convert::{
    alpha_module_path, convert_state_dict_to_peft, normalize, partition_by_target,
    require_up_projections, ConvertError, Dialect, NormalizedCheckpoint,
};
use super::loader::{
    pack_weights, write_lora_layers, CheckpointSource, LoadOptions, LoraLoadError, LoraLoader,
};
use super::network::{FuseReport, InjectError, LoadReport, LoraNetwork, PreparedAdapter};
use super::offload::{with_offloading_suspended, OffloadHook, OffloadHost};
use super::types::{InvalidTargetName, NetworkAlphas, StateDict, TargetKind};
use crate::config::UNetConfig;

/// Errors from the LoRA manager.
#[derive(Debug, Error)]
pub enum LoraManagerError {
    #[error("pipeline has no {0}")]
    MissingTarget(TargetKind),
    #[error(transparent)]
    InvalidTarget(#[from] InvalidTargetName),
    #[error("length of adapter names {names} is not equal to the length of their weights {weights}")]
    WeightLengthMismatch { names: usize, weights: usize },
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),
    #[error("no fused LoRA to unfuse")]
    NothingToUnfuse,
    #[error("adapter {0} is fused into the base weights; unfuse it before deleting")]
    AdapterFused(String),
    #[error("you must pass at least one of unet, text_encoder or text_encoder_2 layers")]
    NoLayersToSave,
    #[error("load error: {0}")]
    LoadError(#[from] LoraLoadError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Configuration for the LoRA manager.
#[derive(Debug, Clone)]
pub struct LoraManagerConfig {
    /// Multiplier applied to every text-encoder adapter at load time.
    pub lora_scale: f32,
    /// UNet configuration; `layers_per_block` drives SGM renumbering.
    pub unet_config: UNetConfig,
}

impl Default for LoraManagerConfig {
    fn default() -> Self {
        Self {
            lora_scale: 1.0,
            unet_config: UNetConfig::default(),
        }
    }
}

/// Options for [`LoraManager::fuse_lora`].
#[derive(Debug, Clone)]
pub struct FuseOptions {
    pub fuse_unet: bool,
    pub fuse_text_encoder: bool,
    /// Extra multiplier on every fused delta.
    pub lora_scale: f64,
    /// Skip layers whose fused weight would contain NaN or infinity.
    pub safe_fusing: bool,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            fuse_unet: true,
            fuse_text_encoder: true,
            lora_scale: 1.0,
            safe_fusing: false,
        }
    }
}

/// Options for [`LoraManager::save_lora_weights`].
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Only the main process writes; others return without touching disk.
    pub is_main_process: bool,
    pub weight_name: Option<String>,
    pub safe_serialization: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            is_main_process: true,
            weight_name: None,
            safe_serialization: true,
        }
    }
}

/// Outcome of [`LoraManager::load_lora_weights`].
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub dialect: Dialect,
    pub adapter_name: String,
    /// Per-target injection reports. Targets without keys are absent.
    pub targets: BTreeMap<TargetKind, LoadReport>,
    /// Targets that had keys but no network in this pipeline.
    pub skipped_targets: Vec<TargetKind>,
}

impl LoadSummary {
    /// Total layers that received the adapter.
    pub fn layers(&self) -> usize {
        self.targets.values().map(|r| r.layers).sum()
    }
}

/// Outcome of [`LoraManager::fuse_lora`].
#[derive(Debug, Clone, Default)]
pub struct FuseSummary {
    pub targets: BTreeMap<TargetKind, FuseReport>,
}

impl FuseSummary {
    /// Layers skipped by safe fusing, as `<target>.<layer>`.
    pub fn skipped_layers(&self) -> Vec<String> {
        self.targets
            .iter()
            .flat_map(|(kind, report)| {
                report
                    .skipped_layers
                    .iter()
                    .map(move |layer| format!("{}{layer}", kind.prefix()))
            })
            .collect()
    }
}

/// Manages LoRA adapters across the networks of a diffusion pipeline.
pub struct LoraManager {
    unet: Option<LoraNetwork>,
    text_encoder: Option<LoraNetwork>,
    text_encoder_2: Option<LoraNetwork>,
    config: LoraManagerConfig,
    loader: LoraLoader,
    /// Fuse calls not yet undone by an unfuse.
    num_fused_loras: usize,
}

impl LoraManager {
    /// Create a manager with no networks attached.
    pub fn new(loader: LoraLoader, config: LoraManagerConfig) -> Self {
        Self {
            unet: None,
            text_encoder: None,
            text_encoder_2: None,
            config,
            loader,
            num_fused_loras: 0,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(device: Device, dtype: DType) -> Self {
        Self::new(LoraLoader::new(device, dtype), LoraManagerConfig::default())
    }

    /// Builder form of [`set_network`](Self::set_network).
    pub fn with_network(mut self, network: LoraNetwork) -> Self {
        self.set_network(network);
        self
    }

    /// Install a network in the slot of its kind, returning the previous one.
    pub fn set_network(&mut self, network: LoraNetwork) -> Option<LoraNetwork> {
        self.slot_mut(network.kind()).replace(network)
    }

    pub fn network(&self, kind: TargetKind) -> Option<&LoraNetwork> {
        match kind {
            TargetKind::Unet => self.unet.as_ref(),
            TargetKind::TextEncoder => self.text_encoder.as_ref(),
            TargetKind::TextEncoder2 => self.text_encoder_2.as_ref(),
        }
    }

    pub fn network_mut(&mut self, kind: TargetKind) -> Option<&mut LoraNetwork> {
        self.slot_mut(kind).as_mut()
    }

    pub fn config(&self) -> &LoraManagerConfig {
        &self.config
    }

    pub fn num_fused_loras(&self) -> usize {
        self.num_fused_loras
    }

    fn slot_mut(&mut self, kind: TargetKind) -> &mut Option<LoraNetwork> {
        match kind {
            TargetKind::Unet => &mut self.unet,
            TargetKind::TextEncoder => &mut self.text_encoder,
            TargetKind::TextEncoder2 => &mut self.text_encoder_2,
        }
    }

    fn networks(&self) -> impl Iterator<Item = &LoraNetwork> {
        [&self.unet, &self.text_encoder, &self.text_encoder_2]
            .into_iter()
            .flatten()
    }

    fn networks_mut(&mut self) -> impl Iterator<Item = &mut LoraNetwork> {
        [
            &mut self.unet,
            &mut self.text_encoder,
            &mut self.text_encoder_2,
        ]
        .into_iter()
        .flatten()
    }

    fn require(&self, kind: TargetKind) -> Result<&LoraNetwork, LoraManagerError> {
        self.network(kind).ok_or(LoraManagerError::MissingTarget(kind))
    }

    fn text_encoder_kind(name: &str) -> Result<TargetKind, LoraManagerError> {
        let kind: TargetKind = name.parse()?;
        if !kind.is_text_encoder() {
            return Err(InvalidTargetName(name.to_string()).into());
        }
        Ok(kind)
    }

    fn has_adapter_anywhere(&self, name: &str) -> bool {
        self.networks().any(|n| n.has_adapter(name))
    }

    /// `default_<n>`, with `n` the largest adapter count over all targets,
    /// bumped until no target uses the name.
    fn next_adapter_name(&self) -> String {
        let mut index = self
            .networks()
            .map(|n| n.adapter_names().len())
            .max()
            .unwrap_or(0);
        loop {
            let candidate = format!("default_{index}");
            if !self.has_adapter_anywhere(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    fn load_scale(&self, kind: TargetKind) -> f32 {
        if kind.is_text_encoder() {
            self.config.lora_scale
        } else {
            1.0
        }
    }

    /// Resolve, read and normalize a checkpoint without touching any network.
    pub fn lora_state_dict(
        &self,
        source: impl Into<CheckpointSource>,
        options: &LoadOptions,
    ) -> Result<NormalizedCheckpoint, LoraManagerError> {
        let state_dict = self.loader.load_state_dict(source.into(), options)?;
        let layers_per_block = self.config.unet_config.layers_per_block;
        Ok(normalize(state_dict, Some(layers_per_block))?)
    }

    /// Load a checkpoint into every target it has keys for.
    ///
    /// Every target is validated before any of them is modified. Targets the
    /// pipeline does not have are skipped with a warning.
    pub fn load_lora_weights(
        &mut self,
        source: impl Into<CheckpointSource>,
        options: &LoadOptions,
    ) -> Result<LoadSummary, LoraManagerError> {
        let checkpoint = self.lora_state_dict(source, options)?;
        let dialect = checkpoint.dialect;
        let partitions = partition_by_target(checkpoint)?;

        let adapter_name = match &options.adapter_name {
            Some(name) => name.clone(),
            None => self.next_adapter_name(),
        };

        let mut prepared = Vec::with_capacity(partitions.len());
        let mut skipped_targets = Vec::new();
        for (kind, part) in partitions {
            let Some(network) = self.network(kind) else {
                warn!(target = %kind, "checkpoint has weights for {kind} but the pipeline has none, skipping");
                skipped_targets.push(kind);
                continue;
            };
            info!(target = %kind, adapter = %adapter_name, "loading {kind}");
            prepared.push(network.prepare_adapter(
                &adapter_name,
                part.state_dict,
                &part.alphas,
                None,
                self.load_scale(kind),
            )?);
        }

        let targets = self.inject(prepared, options.activate)?;
        Ok(LoadSummary {
            dialect,
            adapter_name,
            targets,
            skipped_targets,
        })
    }

    /// Load a canonical state dict into the UNet.
    pub fn load_lora_into_unet(
        &mut self,
        state_dict: StateDict,
        network_alphas: &NetworkAlphas,
        options: &LoadOptions,
    ) -> Result<LoadReport, LoraManagerError> {
        self.load_lora_into(TargetKind::Unet, state_dict, network_alphas, options)
    }

    /// Load a canonical state dict into the first text encoder.
    pub fn load_lora_into_text_encoder(
        &mut self,
        state_dict: StateDict,
        network_alphas: &NetworkAlphas,
        options: &LoadOptions,
    ) -> Result<LoadReport, LoraManagerError> {
        self.load_lora_into(TargetKind::TextEncoder, state_dict, network_alphas, options)
    }

    /// Load the `kind` partition of a canonical state dict.
    ///
    /// Keys are selected by the target's prefix. A checkpoint without any
    /// target prefix is taken as a whole when loading into the UNet.
    pub fn load_lora_into(
        &mut self,
        kind: TargetKind,
        state_dict: StateDict,
        network_alphas: &NetworkAlphas,
        options: &LoadOptions,
    ) -> Result<LoadReport, LoraManagerError> {
        let network = self.require(kind)?;

        let prefixed = state_dict.keys().any(|k| TargetKind::from_key(k).is_some());
        let select = |key: &str| -> Option<String> {
            match kind.strip(key) {
                Some(rest) => Some(rest.to_string()),
                None if !prefixed && kind == TargetKind::Unet => Some(key.to_string()),
                None => None,
            }
        };

        let selected: StateDict = state_dict
            .into_iter()
            .filter_map(|(key, tensor)| select(&key).map(|rest| (rest, tensor)))
            .collect();
        let alphas: HashMap<String, f32> = network_alphas
            .iter()
            .filter_map(|(key, alpha)| {
                select(key).map(|rest| (alpha_module_path(&rest, kind), *alpha))
            })
            .collect();

        let adapter_name = match &options.adapter_name {
            Some(name) => name.clone(),
            None => network.next_adapter_name(),
        };
        let selected = convert_state_dict_to_peft(selected, kind);
        require_up_projections(kind, &selected)?;

        info!(target = %kind, adapter = %adapter_name, "loading {kind}");
        let prepared = network.prepare_adapter(
            &adapter_name,
            selected,
            &alphas,
            None,
            self.load_scale(kind),
        )?;

        let mut reports = self.inject(vec![prepared], options.activate)?;
        Ok(reports.remove(&kind).unwrap_or_default())
    }

    /// Attach prepared adapters with offload hooks suspended.
    fn inject(
        &mut self,
        prepared: Vec<PreparedAdapter>,
        activate: bool,
    ) -> Result<BTreeMap<TargetKind, LoadReport>, LoraManagerError> {
        with_offloading_suspended(self, |manager| {
            let mut reports = BTreeMap::new();
            for adapter in prepared {
                let kind = adapter.target();
                let network = manager
                    .network_mut(kind)
                    .ok_or(LoraManagerError::MissingTarget(kind))?;
                let report = network.attach(adapter);
                if activate {
                    network.activate_adapter(&report.adapter_name, 1.0);
                }
                reports.insert(kind, report);
            }
            Ok(reports)
        })
    }

    /// Merge the active adapters into the base weights of the selected targets.
    ///
    /// Either every selected target is fused or, on error, none is and the
    /// fuse counter is unchanged.
    pub fn fuse_lora(&mut self, options: &FuseOptions) -> Result<FuseSummary, LoraManagerError> {
        let kinds: Vec<TargetKind> = TargetKind::ALL
            .into_iter()
            .filter(|k| {
                if k.is_text_encoder() {
                    options.fuse_text_encoder
                } else {
                    options.fuse_unet
                }
            })
            .collect();

        let summary = with_offloading_suspended(self, |manager| {
            let mut summary = FuseSummary::default();
            for kind in kinds {
                let Some(network) = manager.network_mut(kind) else {
                    continue;
                };
                match network.fuse(options.lora_scale, options.safe_fusing) {
                    Ok(report) => {
                        summary.targets.insert(kind, report);
                    }
                    Err(e) => {
                        // Targets fused earlier in this call go back to their prior weights.
                        for (done, report) in &summary.targets {
                            if let Some(network) = manager.network_mut(*done) {
                                network.revert_fuse(report);
                            }
                        }
                        return Err(LoraManagerError::from(e));
                    }
                }
            }
            Ok(summary)
        })?;

        self.num_fused_loras += 1;
        if self.num_fused_loras > 1 {
            warn!(
                fused = self.num_fused_loras,
                "the current API supports fusing one LoRA at a time; fusing more than one \
                 without unfusing in between may give unexpected results"
            );
        }
        Ok(summary)
    }

    /// Restore the base weights of the selected targets.
    ///
    /// Returns the number of layers restored.
    pub fn unfuse_lora(
        &mut self,
        unfuse_unet: bool,
        unfuse_text_encoder: bool,
    ) -> Result<usize, LoraManagerError> {
        if self.num_fused_loras == 0 {
            return Err(LoraManagerError::NothingToUnfuse);
        }
        let mut restored = 0;
        for network in self.networks_mut() {
            let selected = if network.kind().is_text_encoder() {
                unfuse_text_encoder
            } else {
                unfuse_unet
            };
            if selected {
                restored += network.unfuse()?;
            }
        }
        self.num_fused_loras -= 1;
        Ok(restored)
    }

    fn resolve_weights(names: &[&str], weights: Option<&[f32]>) -> Result<Vec<f32>, LoraManagerError> {
        match weights {
            None => Ok(vec![1.0; names.len()]),
            Some(weights) if weights.len() != names.len() => {
                Err(LoraManagerError::WeightLengthMismatch {
                    names: names.len(),
                    weights: weights.len(),
                })
            }
            Some(weights) => Ok(weights.to_vec()),
        }
    }

    /// Make exactly `names` active on every target, with `weights` (1.0 each
    /// by default). Nothing changes if any argument is invalid.
    pub fn set_adapters(&mut self, names: &[&str], weights: Option<&[f32]>) -> Result<(), LoraManagerError> {
        let weights = Self::resolve_weights(names, weights)?;
        if let Some(missing) = names.iter().find(|n| !self.has_adapter_anywhere(n)) {
            return Err(LoraManagerError::AdapterNotFound(missing.to_string()));
        }

        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        for network in self.networks_mut() {
            network.set_adapters(&names, &weights);
        }
        Ok(())
    }

    /// [`set_adapters`](Self::set_adapters) restricted to one text encoder.
    pub fn set_adapters_for_text_encoder(
        &mut self,
        text_encoder: &str,
        names: &[&str],
        weights: Option<&[f32]>,
    ) -> Result<(), LoraManagerError> {
        let kind = Self::text_encoder_kind(text_encoder)?;
        let weights = Self::resolve_weights(names, weights)?;
        let network = self.require(kind)?;
        if let Some(missing) = names.iter().find(|n| !network.has_adapter(n)) {
            return Err(LoraManagerError::AdapterNotFound(missing.to_string()));
        }

        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        if let Some(network) = self.network_mut(kind) {
            network.set_adapters(&names, &weights);
        }
        Ok(())
    }

    /// Turn adapters back on everywhere without changing their weights.
    pub fn enable_lora(&mut self) {
        for network in self.networks_mut() {
            network.enable_adapters(true);
        }
    }

    /// Bypass every adapter without detaching it.
    pub fn disable_lora(&mut self) {
        for network in self.networks_mut() {
            network.enable_adapters(false);
        }
    }

    pub fn enable_lora_for_text_encoder(&mut self, text_encoder: &str) -> Result<(), LoraManagerError> {
        self.toggle_text_encoder(text_encoder, true)
    }

    pub fn disable_lora_for_text_encoder(&mut self, text_encoder: &str) -> Result<(), LoraManagerError> {
        self.toggle_text_encoder(text_encoder, false)
    }

    fn toggle_text_encoder(&mut self, text_encoder: &str, enabled: bool) -> Result<(), LoraManagerError> {
        let kind = Self::text_encoder_kind(text_encoder)?;
        self.network_mut(kind)
            .ok_or(LoraManagerError::MissingTarget(kind))?
            .enable_adapters(enabled);
        Ok(())
    }

    /// Remove adapters from every target.
    ///
    /// All names are checked first: an unknown or fused adapter aborts the
    /// call before anything is deleted.
    pub fn delete_adapters(&mut self, names: &[&str]) -> Result<(), LoraManagerError> {
        for name in names {
            if !self.has_adapter_anywhere(name) {
                return Err(LoraManagerError::AdapterNotFound(name.to_string()));
            }
            if self.networks().any(|n| n.is_adapter_fused(name)) {
                return Err(LoraManagerError::AdapterFused(name.to_string()));
            }
        }
        for name in names {
            for network in self.networks_mut() {
                network.delete_adapter(name);
            }
            info!(adapter = %name, "deleted adapter");
        }
        Ok(())
    }

    /// Remove every adapter from every target. Fused deltas stay in the weights.
    pub fn unload_lora_weights(&mut self) {
        for network in self.networks_mut() {
            network.unload();
        }
        self.num_fused_loras = 0;
    }

    /// Active adapters of the UNet, in activation order.
    pub fn get_active_adapters(&self) -> Result<Vec<String>, LoraManagerError> {
        Ok(self.require(TargetKind::Unet)?.active_adapters().to_vec())
    }

    /// Attached adapters per target name. Targets without adapters are omitted.
    pub fn get_list_adapters(&self) -> BTreeMap<String, Vec<String>> {
        self.networks()
            .filter(|n| !n.adapter_names().is_empty())
            .map(|n| (n.kind().name().to_string(), n.adapter_names().to_vec()))
            .collect()
    }

    /// Move the named adapters' tensors to `device` on every target.
    pub fn set_lora_device(&mut self, names: &[&str], device: &Device) -> Result<(), LoraManagerError> {
        if let Some(missing) = names.iter().find(|n| !self.has_adapter_anywhere(n)) {
            return Err(LoraManagerError::AdapterNotFound(missing.to_string()));
        }
        with_offloading_suspended(self, |manager| {
            for network in manager.networks_mut() {
                for name in names {
                    network.set_adapter_device(name, device)?;
                }
            }
            Ok(())
        })
    }

    /// Pack per-target PEFT state dicts under their prefixes and write them
    /// to one file in `save_directory`.
    pub fn save_lora_weights(
        save_directory: impl AsRef<Path>,
        unet_lora_layers: Option<StateDict>,
        text_encoder_lora_layers: Option<StateDict>,
        text_encoder_2_lora_layers: Option<StateDict>,
        options: &SaveOptions,
    ) -> Result<Option<PathBuf>, LoraManagerError> {
        let partitions = [
            (TargetKind::Unet, unet_lora_layers),
            (TargetKind::TextEncoder, text_encoder_lora_layers),
            (TargetKind::TextEncoder2, text_encoder_2_lora_layers),
        ];
        if partitions.iter().all(|(_, layers)| layers.is_none()) {
            return Err(LoraManagerError::NoLayersToSave);
        }

        let mut state_dict = StateDict::new();
        for (kind, layers) in partitions {
            if let Some(layers) = layers {
                state_dict.extend(pack_weights(layers, kind.name()));
            }
        }
        Ok(write_lora_layers(
            &state_dict,
            save_directory,
            options.is_main_process,
            options.weight_name.as_deref(),
            options.safe_serialization,
        )?)
    }

    /// Export an attached adapter from every target that has it and save it.
    pub fn save_adapter(
        &self,
        adapter_name: &str,
        save_directory: impl AsRef<Path>,
        options: &SaveOptions,
    ) -> Result<Option<PathBuf>, LoraManagerError> {
        let export = |kind: TargetKind| -> Result<Option<StateDict>, LoraManagerError> {
            match self.network(kind) {
                Some(network) if network.has_adapter(adapter_name) => {
                    Ok(Some(network.adapter_state_dict(adapter_name)?))
                }
                _ => Ok(None),
            }
        };
        let unet = export(TargetKind::Unet)?;
        let text_encoder = export(TargetKind::TextEncoder)?;
        let text_encoder_2 = export(TargetKind::TextEncoder2)?;
        if unet.is_none() && text_encoder.is_none() && text_encoder_2.is_none() {
            return Err(LoraManagerError::AdapterNotFound(adapter_name.to_string()));
        }
        Self::save_lora_weights(save_directory, unet, text_encoder, text_encoder_2, options)
    }
}

impl OffloadHost for LoraManager {
    fn offload_components(&mut self) -> Vec<&mut LoraNetwork> {
        self.networks_mut().collect()
    }

    fn enable_model_cpu_offload(&mut self) {
        for network in self.networks_mut() {
            network.set_offload_hook(Some(OffloadHook::ModelCpuOffload));
        }
    }

    fn enable_sequential_cpu_offload(&mut self) {
        for network in self.networks_mut() {
            network.set_offload_hook(Some(OffloadHook::SequentialCpuOffload));
        }
    }
}
