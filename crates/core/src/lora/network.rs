//! Target networks (UNet, text encoders) as seen by the adapter machinery.
//!
//! A [`LoraNetwork`] is a flat map from dotted module path to
//! [`LinearWithLora`]. Adapters are injected in two phases: a fallible
//! [`prepare_adapter`](LoraNetwork::prepare_adapter) that validates every
//! layer without touching the network, then an infallible
//! [`attach`](LoraNetwork::attach).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};
use thiserror::Error;
use tracing::{debug, warn};

use super::convert::{group_by_module, ConvertError};
use super::linear::{LinearWithLora, MergeOutcome};
use super::offload::OffloadHook;
use super::types::{LoraAdapter, LoraModel, Rank, StateDict, TargetKind};

/// Errors that can occur while attaching an adapter to a network.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("adapter name {name} already in use in {target}")]
    AdapterNameInUse { target: TargetKind, name: String },
    #[error("missing lora_A or lora_B for module {0}")]
    IncompleteAdapter(String),
    #[error("LoRA for {module} does not fit: weight {weight:?}, lora_A {a_shape:?}, lora_B {b_shape:?}")]
    ShapeMismatch {
        module: String,
        weight: Vec<usize>,
        a_shape: Vec<usize>,
        b_shape: Vec<usize>,
    },
    #[error("rank mismatch for {module}: expected {expected}, lora_A has {down}, lora_B has {up}")]
    RankMismatch {
        module: String,
        expected: usize,
        down: usize,
        up: usize,
    },
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Enumerates the attention and MLP submodules of a network family.
pub trait SubmoduleEnumerator: Send + Sync {
    /// Attention blocks, as module paths.
    fn attention_modules(&self, network: &LoraNetwork) -> Vec<String>;

    /// MLP blocks, as module paths.
    fn mlp_modules(&self, network: &LoraNetwork) -> Vec<String>;

    /// Layers that may receive a LoRA.
    fn lora_targets(&self, network: &LoraNetwork) -> BTreeSet<String>;
}

/// Diffusion UNet: every linear or convolution layer may carry a LoRA.
#[derive(Debug, Clone, Copy, Default)]
pub struct UNetModules;

impl SubmoduleEnumerator for UNetModules {
    fn attention_modules(&self, network: &LoraNetwork) -> Vec<String> {
        parents_ending_with(network, &[".attn1", ".attn2"])
    }

    fn mlp_modules(&self, network: &LoraNetwork) -> Vec<String> {
        parents_ending_with(network, &[".ff"])
    }

    fn lora_targets(&self, network: &LoraNetwork) -> BTreeSet<String> {
        network.layer_names().map(str::to_string).collect()
    }
}

/// CLIP text encoder: `self_attn.{q,k,v,out}_proj` and `mlp.fc{1,2}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipTextModules;

const CLIP_ATTENTION_PROJECTIONS: [&str; 4] = ["q_proj", "k_proj", "v_proj", "out_proj"];
const CLIP_MLP_PROJECTIONS: [&str; 2] = ["fc1", "fc2"];

impl SubmoduleEnumerator for ClipTextModules {
    fn attention_modules(&self, network: &LoraNetwork) -> Vec<String> {
        parents_ending_with(network, &[".self_attn"])
    }

    fn mlp_modules(&self, network: &LoraNetwork) -> Vec<String> {
        parents_ending_with(network, &[".mlp"])
    }

    fn lora_targets(&self, network: &LoraNetwork) -> BTreeSet<String> {
        let attention = self
            .attention_modules(network)
            .into_iter()
            .flat_map(|m| CLIP_ATTENTION_PROJECTIONS.map(|p| format!("{m}.{p}")));
        let mlp = self
            .mlp_modules(network)
            .into_iter()
            .flat_map(|m| CLIP_MLP_PROJECTIONS.map(|p| format!("{m}.{p}")));
        attention
            .chain(mlp)
            .filter(|path| network.layer(path).is_some())
            .collect()
    }
}

/// Distinct ancestors of layer paths whose path ends with one of `suffixes`,
/// ordered by numeric path segments.
fn parents_ending_with(network: &LoraNetwork, suffixes: &[&str]) -> Vec<String> {
    let mut parents = BTreeSet::new();
    for name in network.layer_names() {
        for suffix in suffixes {
            let needle = format!("{suffix}.");
            if let Some(pos) = name.find(&needle) {
                parents.insert(name[..pos + suffix.len()].to_string());
            }
        }
    }
    let mut parents: Vec<String> = parents.into_iter().collect();
    parents.sort_by_key(|p| numeric_sort_key(p));
    parents
}

fn numeric_sort_key(path: &str) -> Vec<(usize, String)> {
    path.split('.')
        .map(|seg| match seg.parse::<usize>() {
            Ok(n) => (n, String::new()),
            Err(_) => (usize::MAX, seg.to_string()),
        })
        .collect()
}

static UNET_MODULES: UNetModules = UNetModules;
static CLIP_TEXT_MODULES: ClipTextModules = ClipTextModules;

impl TargetKind {
    /// Submodule layout of this target.
    pub fn submodules(&self) -> &'static dyn SubmoduleEnumerator {
        match self {
            TargetKind::Unet => &UNET_MODULES,
            TargetKind::TextEncoder | TargetKind::TextEncoder2 => &CLIP_TEXT_MODULES,
        }
    }
}

/// An adapter validated against a network but not yet attached.
#[derive(Debug)]
pub struct PreparedAdapter {
    target: TargetKind,
    name: String,
    model: LoraModel,
    unexpected_keys: Vec<String>,
}

impl PreparedAdapter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> TargetKind {
        self.target
    }

    pub fn num_layers(&self) -> usize {
        self.model.num_adapters()
    }
}

/// Outcome of attaching an adapter.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub adapter_name: String,
    /// Layers that received the adapter.
    pub layers: usize,
    /// Keys naming modules the network does not have (or does not adapt).
    pub unexpected_keys: Vec<String>,
}

/// Outcome of fusing adapters into a network.
#[derive(Debug, Clone, Default)]
pub struct FuseReport {
    pub fused_layers: usize,
    /// Layers left untouched because the fused weight was not finite.
    pub skipped_layers: Vec<String>,
    /// Layer path and number of adapters merged there by this fuse.
    merges: Vec<(String, usize)>,
}

/// A target network holding LoRA-capable layers.
#[derive(Debug, Clone)]
pub struct LoraNetwork {
    kind: TargetKind,
    layers: BTreeMap<String, LinearWithLora>,
    /// Attached adapter names, in attachment order.
    adapters: Vec<String>,
    /// Active adapter names, in activation order.
    active: Vec<String>,
    enabled: bool,
    offload_hook: Option<OffloadHook>,
}

impl LoraNetwork {
    pub fn new(kind: TargetKind) -> Self {
        Self {
            kind,
            layers: BTreeMap::new(),
            adapters: Vec::new(),
            active: Vec::new(),
            enabled: true,
            offload_hook: None,
        }
    }

    /// Build a network from base-model weights. Every `<path>.weight` with
    /// two or more dimensions becomes a layer, paired with `<path>.bias`.
    pub fn from_state_dict(kind: TargetKind, weights: StateDict) -> Self {
        let mut weights = weights;
        let weight_keys: Vec<String> = weights
            .iter()
            .filter(|(k, t)| k.ends_with(".weight") && t.rank() >= 2)
            .map(|(k, _)| k.clone())
            .collect();

        let mut network = Self::new(kind);
        for key in weight_keys {
            let Some(path) = key.strip_suffix(".weight") else {
                continue;
            };
            let bias = weights.remove(&format!("{path}.bias"));
            if let Some(weight) = weights.remove(&key) {
                network.insert_layer(path, LinearWithLora::from_weight(weight, bias));
            }
        }
        debug!(target = %kind, layers = network.num_layers(), "built LoRA network");
        network
    }

    /// Load base-model weights from a safetensors file.
    pub fn from_safetensors(
        kind: TargetKind,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let weights = candle_core::safetensors::load(path, device)?;
        Ok(Self::from_state_dict(kind, weights))
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn insert_layer(&mut self, path: impl Into<String>, layer: LinearWithLora) {
        self.layers.insert(path.into(), layer);
    }

    pub fn layer(&self, path: &str) -> Option<&LinearWithLora> {
        self.layers.get(path)
    }

    pub fn layer_mut(&mut self, path: &str) -> Option<&mut LinearWithLora> {
        self.layers.get_mut(path)
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &LinearWithLora)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn submodules(&self) -> &'static dyn SubmoduleEnumerator {
        self.kind.submodules()
    }

    /// Attached adapter names, in attachment order.
    pub fn adapter_names(&self) -> &[String] {
        &self.adapters
    }

    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.iter().any(|n| n == name)
    }

    /// Default name for the next adapter: `default_<n>` with `n` the number
    /// of attached adapters, bumped past any name already taken.
    pub fn next_adapter_name(&self) -> String {
        let mut index = self.adapters.len();
        loop {
            let candidate = format!("default_{index}");
            if !self.has_adapter(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    /// Validate a PEFT-form partition (target prefix removed) against this
    /// network without modifying it.
    ///
    /// `alphas` is keyed by module path. Alphas embedded in `state_dict`
    /// take precedence. Every adapter scale is multiplied by `scale`.
    pub fn prepare_adapter(
        &self,
        adapter_name: &str,
        state_dict: StateDict,
        alphas: &HashMap<String, f32>,
        rank: Option<&Rank>,
        scale: f32,
    ) -> Result<PreparedAdapter, InjectError> {
        if self.has_adapter(adapter_name) {
            return Err(InjectError::AdapterNameInUse {
                target: self.kind,
                name: adapter_name.to_string(),
            });
        }

        let (groups, mut unexpected_keys) = group_by_module(state_dict)?;
        let targets = self.submodules().lora_targets(self);
        let inferred;
        let rank = match rank {
            Some(rank) => Some(rank),
            None => {
                inferred = Rank::infer(
                    groups
                        .iter()
                        .filter_map(|(module, g)| g.up.as_ref().map(|up| (module.as_str(), up))),
                );
                inferred.as_ref()
            }
        };

        let mut model = LoraModel::new();
        for (module, weights) in groups {
            let Some(layer) = self.layers.get(&module).filter(|_| targets.contains(&module)) else {
                if weights.down.is_some() {
                    unexpected_keys.push(format!("{module}.lora_A.weight"));
                }
                if weights.up.is_some() {
                    unexpected_keys.push(format!("{module}.lora_B.weight"));
                }
                continue;
            };

            let (down, up) = match (weights.down, weights.up) {
                (Some(down), Some(up)) => (down, up),
                _ => return Err(InjectError::IncompleteAdapter(module)),
            };

            let down_rank = down.dims().first().copied().unwrap_or(0);
            let up_rank = up.dims().get(1).copied().unwrap_or(0);
            let expected = rank.and_then(|r| r.for_layer(&module)).unwrap_or(up_rank);
            if down_rank != expected || up_rank != expected {
                return Err(InjectError::RankMismatch {
                    module,
                    expected,
                    down: down_rank,
                    up: up_rank,
                });
            }

            let alpha = weights.alpha.or_else(|| alphas.get(&module).copied());
            let mut adapter = LoraAdapter::new(down, up, expected, alpha);
            adapter.scale_by(scale);

            if !layer.fits(&adapter) {
                return Err(InjectError::ShapeMismatch {
                    module,
                    weight: layer.weight().dims().to_vec(),
                    a_shape: adapter.lora_a.dims().to_vec(),
                    b_shape: adapter.lora_b.dims().to_vec(),
                });
            }
            model.add_adapter(module, adapter);
        }

        unexpected_keys.sort();
        Ok(PreparedAdapter {
            target: self.kind,
            name: adapter_name.to_string(),
            model,
            unexpected_keys,
        })
    }

    /// Attach a prepared adapter. The adapter starts out inactive.
    pub fn attach(&mut self, prepared: PreparedAdapter) -> LoadReport {
        let PreparedAdapter {
            name,
            model,
            unexpected_keys,
            ..
        } = prepared;

        if !unexpected_keys.is_empty() {
            warn!(
                target = %self.kind,
                adapter = %name,
                keys = ?unexpected_keys,
                "loading adapter weights led to unexpected keys not found in the model"
            );
        }

        let layers = model.num_adapters();
        for (module, adapter) in model.adapters {
            if let Some(layer) = self.layers.get_mut(&module) {
                layer.register_adapter(name.clone(), adapter);
            }
        }
        if layers > 0 && !self.has_adapter(&name) {
            self.adapters.push(name.clone());
        }
        debug!(target = %self.kind, adapter = %name, layers, "attached adapter");

        LoadReport {
            adapter_name: name,
            layers,
            unexpected_keys,
        }
    }

    /// Prepare and attach in one step.
    pub fn load_adapter_state_dict(
        &mut self,
        adapter_name: &str,
        state_dict: StateDict,
        alphas: &HashMap<String, f32>,
        rank: Option<&Rank>,
        scale: f32,
    ) -> Result<LoadReport, InjectError> {
        let prepared = self.prepare_adapter(adapter_name, state_dict, alphas, rank, scale)?;
        Ok(self.attach(prepared))
    }

    /// Active adapter names, in activation order.
    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    /// Replace the active set. Names not attached here are skipped.
    pub fn set_adapters(&mut self, names: &[String], weights: &[f32]) {
        self.active = names
            .iter()
            .filter(|n| self.has_adapter(n))
            .cloned()
            .collect();
        for layer in self.layers.values_mut() {
            layer.set_active_adapters(names, weights);
        }
    }

    /// Add one attached adapter to the active set.
    pub fn activate_adapter(&mut self, name: &str, weight: f32) {
        if !self.has_adapter(name) {
            return;
        }
        if !self.active.iter().any(|n| n == name) {
            self.active.push(name.to_string());
        }
        for layer in self.layers.values_mut() {
            layer.activate_adapter(name, weight);
        }
    }

    pub fn enable_adapters(&mut self, enabled: bool) {
        self.enabled = enabled;
        for layer in self.layers.values_mut() {
            layer.set_enabled(enabled);
        }
    }

    pub fn adapters_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether any layer has `name` merged into its weight.
    pub fn is_adapter_fused(&self, name: &str) -> bool {
        self.layers.values().any(|l| l.is_adapter_merged(name))
    }

    pub fn is_fused(&self) -> bool {
        self.layers.values().any(|l| l.is_merged())
    }

    /// Remove an adapter from every layer. Returns false if it was not attached.
    pub fn delete_adapter(&mut self, name: &str) -> bool {
        if !self.has_adapter(name) {
            return false;
        }
        for layer in self.layers.values_mut() {
            layer.remove_adapter(name);
        }
        self.adapters.retain(|n| n != name);
        self.active.retain(|n| n != name);
        true
    }

    /// Remove every adapter. Fused deltas stay in the weights.
    pub fn unload(&mut self) {
        for layer in self.layers.values_mut() {
            layer.clear_adapters();
        }
        self.adapters.clear();
        self.active.clear();
    }

    /// Merge active adapters into the base weights.
    ///
    /// On error, layers merged by this call are restored before returning.
    pub fn fuse(&mut self, extra_scale: f64, safe: bool) -> candle_core::Result<FuseReport> {
        let mut report = FuseReport::default();
        let paths: Vec<String> = self.layers.keys().cloned().collect();
        for path in paths {
            let Some(layer) = self.layers.get_mut(&path) else {
                continue;
            };
            match layer.merge(extra_scale, safe) {
                Ok(MergeOutcome::Merged(count)) => {
                    report.fused_layers += 1;
                    report.merges.push((path, count));
                }
                Ok(MergeOutcome::Unchanged) => {}
                Ok(MergeOutcome::NonFinite) => {
                    warn!(target = %self.kind, layer = %path, "fused weight is not finite, layer skipped");
                    report.skipped_layers.push(path);
                }
                Err(e) => {
                    self.revert_fuse(&report);
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Undo exactly the merges recorded in `report`, most recent first.
    pub fn revert_fuse(&mut self, report: &FuseReport) {
        for (path, count) in report.merges.iter().rev() {
            let Some(layer) = self.layers.get_mut(path) else {
                continue;
            };
            if let Err(e) = layer.unmerge_latest(*count) {
                warn!(target = %self.kind, layer = %path, error = %e, "could not restore fused weight");
            }
        }
    }

    /// Undo every merge. Returns the number of layers restored.
    pub fn unfuse(&mut self) -> candle_core::Result<usize> {
        let mut restored = 0;
        for layer in self.layers.values_mut() {
            if layer.unmerge()? > 0 {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Export one adapter in PEFT form: `<module>.lora_A.weight`,
    /// `<module>.lora_B.weight` and `<module>.alpha` when an alpha is known.
    pub fn adapter_state_dict(&self, name: &str) -> candle_core::Result<StateDict> {
        let mut state_dict = StateDict::new();
        for (path, layer) in &self.layers {
            let Some(adapter) = layer.adapter(name) else {
                continue;
            };
            state_dict.insert(format!("{path}.lora_A.weight"), adapter.lora_a.clone());
            state_dict.insert(format!("{path}.lora_B.weight"), adapter.lora_b.clone());
            if let Some(alpha) = adapter.alpha {
                state_dict.insert(
                    format!("{path}.alpha"),
                    Tensor::new(alpha, adapter.lora_a.device())?,
                );
            }
        }
        Ok(state_dict)
    }

    /// Move an adapter's matrices to `device`. Returns the number of layers touched.
    pub fn set_adapter_device(&mut self, name: &str, device: &Device) -> candle_core::Result<usize> {
        let mut moved = 0;
        for layer in self.layers.values_mut() {
            if layer.adapter_to_device(name, device)? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub fn offload_hook(&self) -> Option<OffloadHook> {
        self.offload_hook
    }

    pub fn set_offload_hook(&mut self, hook: Option<OffloadHook>) {
        self.offload_hook = hook;
    }

    /// Remove and return the installed offload hook.
    pub fn take_offload_hook(&mut self) -> Option<OffloadHook> {
        self.offload_hook.take()
    }
}
