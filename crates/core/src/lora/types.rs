//! LoRA types and data structures.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Shape, Tensor};
use thiserror::Error;

/// Flat mapping from dotted key to tensor, as stored in a checkpoint file.
pub type StateDict = HashMap<String, Tensor>;

/// Per-layer alpha values keyed by `<dotted path>.alpha`.
pub type NetworkAlphas = HashMap<String, f32>;

/// Default file name for the legacy (pickle) tensor archive.
pub const LORA_WEIGHT_NAME: &str = "pytorch_lora_weights.bin";
/// Default file name for the safetensors archive.
pub const LORA_WEIGHT_NAME_SAFE: &str = "pytorch_lora_weights.safetensors";

/// Returned when a string does not name a known target.
#[derive(Debug, Clone, Error)]
#[error("invalid target name: {0} (expected unet, text_encoder or text_encoder_2)")]
pub struct InvalidTargetName(pub String);

/// Submodule of a diffusion pipeline that can receive LoRA weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    Unet,
    TextEncoder,
    TextEncoder2,
}

impl TargetKind {
    /// Every target, in load order.
    pub const ALL: [TargetKind; 3] = [
        TargetKind::Unet,
        TargetKind::TextEncoder,
        TargetKind::TextEncoder2,
    ];

    /// Attribute name of the target on a pipeline.
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Unet => "unet",
            TargetKind::TextEncoder => "text_encoder",
            TargetKind::TextEncoder2 => "text_encoder_2",
        }
    }

    /// Key prefix used by canonical checkpoints, including the trailing dot.
    pub fn prefix(&self) -> &'static str {
        match self {
            TargetKind::Unet => "unet.",
            TargetKind::TextEncoder => "text_encoder.",
            TargetKind::TextEncoder2 => "text_encoder_2.",
        }
    }

    pub fn is_text_encoder(&self) -> bool {
        !matches!(self, TargetKind::Unet)
    }

    /// Classify a canonical key by its leading namespace.
    ///
    /// Only the first dotted segment is considered, so `text_encoder_2.x`
    /// never matches `text_encoder`.
    pub fn from_key(key: &str) -> Option<Self> {
        let head = key.split('.').next()?;
        Self::ALL.into_iter().find(|t| t.name() == head && key.len() > head.len())
    }

    /// Strip this target's prefix from `key`, if present.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix())
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetKind {
    type Err = InvalidTargetName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unet" => Ok(TargetKind::Unet),
            "text_encoder" | "text_encoder_1" => Ok(TargetKind::TextEncoder),
            "text_encoder_2" => Ok(TargetKind::TextEncoder2),
            other => Err(InvalidTargetName(other.to_string())),
        }
    }
}

/// Role of a tensor within a low-rank pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoraComponent {
    /// Down-projection (`lora_A`), shape `[rank, in, ...]`.
    Down,
    /// Up-projection (`lora_B`), shape `[out, rank, ...]`.
    Up,
    /// Scalar alpha.
    Alpha,
}

/// Rank of the low-rank pairs in a partition.
#[derive(Debug, Clone, PartialEq)]
pub enum Rank {
    /// Every layer shares one rank.
    Uniform(usize),
    /// Rank keyed by module path.
    PerLayer(BTreeMap<String, usize>),
}

impl Rank {
    /// Infer ranks from up-projection shapes, collapsing to `Uniform` when
    /// all layers agree. Returns `None` for an empty partition.
    pub fn infer<'a>(up_projections: impl IntoIterator<Item = (&'a str, &'a Tensor)>) -> Option<Self> {
        let per_layer: BTreeMap<String, usize> = up_projections
            .into_iter()
            .filter_map(|(module, up)| up.dims().get(1).map(|r| (module.to_string(), *r)))
            .collect();
        let first = *per_layer.values().next()?;
        if per_layer.values().all(|r| *r == first) {
            Some(Rank::Uniform(first))
        } else {
            Some(Rank::PerLayer(per_layer))
        }
    }

    /// Rank expected for `module`, if known.
    pub fn for_layer(&self, module: &str) -> Option<usize> {
        match self {
            Rank::Uniform(r) => Some(*r),
            Rank::PerLayer(map) => map.get(module).copied(),
        }
    }
}

/// LoRA weights of one adapter for a single layer (low-rank matrices A and B).
///
/// The contribution added to the base weight is:
/// ```text
/// delta = scale * multiplier * (lora_b @ lora_a)
/// ```
///
/// Where:
/// - lora_a: [rank, input_dim] (or [rank, in, kh, kw] for convolutions)
/// - lora_b: [output_dim, rank] (or [out, rank, 1, 1])
/// - scale: alpha / rank, or 1.0 when the checkpoint carries no alpha
/// - multiplier: per-adapter weight chosen with `set_adapters`
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Low-rank matrix A (down-projection).
    pub lora_a: Tensor,
    /// Low-rank matrix B (up-projection).
    pub lora_b: Tensor,
    /// LoRA rank.
    pub rank: usize,
    /// Alpha parameter, if the checkpoint provided one.
    pub alpha: Option<f32>,
    /// Pre-computed scale (alpha / rank).
    pub scale: f32,
    /// Activation weight.
    pub multiplier: f32,
}

impl LoraAdapter {
    /// Create a new LoRA adapter.
    ///
    /// # Arguments
    /// * `lora_a` - Down-projection [rank, input_dim, ...]
    /// * `lora_b` - Up-projection [output_dim, rank, ...]
    /// * `rank` - LoRA rank
    /// * `alpha` - Optional alpha scaling parameter
    pub fn new(lora_a: Tensor, lora_b: Tensor, rank: usize, alpha: Option<f32>) -> Self {
        let scale = match alpha {
            Some(alpha) if rank > 0 => alpha / rank as f32,
            _ => 1.0,
        };
        Self {
            lora_a,
            lora_b,
            rank,
            alpha,
            scale,
            multiplier: 1.0,
        }
    }

    /// Input dimension (flattened trailing dims of `lora_a`).
    pub fn input_dim(&self) -> usize {
        self.lora_a.dims().iter().skip(1).product()
    }

    /// Output dimension (from lora_b shape).
    pub fn output_dim(&self) -> usize {
        self.lora_b.dims()[0]
    }

    /// Effective factor applied to `lora_b @ lora_a`.
    pub fn scaling(&self) -> f64 {
        self.scale as f64 * self.multiplier as f64
    }

    /// Multiply the stored scale, e.g. by a pipeline-wide text-encoder LoRA scale.
    pub fn scale_by(&mut self, factor: f32) {
        self.scale *= factor;
    }

    /// Full-rank weight delta `scale * (lora_b @ lora_a)` reshaped to `weight_shape`.
    pub fn delta(&self, weight_shape: &Shape, scale: f64) -> candle_core::Result<Tensor> {
        let up = self.lora_b.reshape((self.output_dim(), self.rank))?;
        let down = self.lora_a.reshape((self.rank, self.input_dim()))?;
        let delta = up.matmul(&down)?.reshape(weight_shape)?;
        delta.affine(scale, 0.0)
    }

    /// Move both matrices to `device`.
    pub fn to_device(&mut self, device: &Device) -> candle_core::Result<()> {
        self.lora_a = self.lora_a.to_device(device)?;
        self.lora_b = self.lora_b.to_device(device)?;
        Ok(())
    }
}

/// A complete LoRA for one target, grouped by module path, ready to be
/// attached to a network under an adapter name.
#[derive(Debug, Default)]
pub struct LoraModel {
    /// Adapters by module path (e.g. "down_blocks.0.attentions.0.proj_in").
    pub adapters: BTreeMap<String, LoraAdapter>,
}

impl LoraModel {
    /// Create a new empty LoRA model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get adapter for a specific module path.
    pub fn get_adapter(&self, module_name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(module_name)
    }

    /// Add an adapter for a module.
    pub fn add_adapter(&mut self, module_name: impl Into<String>, adapter: LoraAdapter) {
        self.adapters.insert(module_name.into(), adapter);
    }

    /// Number of layers with adapters.
    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
