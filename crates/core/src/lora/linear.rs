//! Linear (and convolution-weight) layer with LoRA adapter support.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use tracing::warn;

use super::types::LoraAdapter;

/// Adapter whose delta has been folded into the base weight.
#[derive(Debug, Clone)]
struct MergedAdapter {
    name: String,
    /// Factor the delta was multiplied by when merged.
    scale: f64,
}

/// Result of merging active adapters into one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// This many adapters were folded into the weight.
    Merged(usize),
    /// Nothing to merge: the layer is disabled or has no unmerged active adapters.
    Unchanged,
    /// The merged weight contained NaN or infinity and was discarded.
    NonFinite,
}

/// Layer wrapper that supports LoRA adapters.
///
/// The forward computation is:
/// ```text
/// output = x @ W.T + b + sum_active(scaling * (x @ lora_a.T @ lora_b.T))
/// ```
///
/// Several adapters can be registered. Which ones contribute is controlled by
/// the active list, and the whole layer can be switched off with
/// [`set_enabled`](Self::set_enabled). Merged adapters live in `W` and are
/// not applied a second time.
///
/// Weights with more than two dimensions (convolutions) support merging but
/// not the forward pass.
#[derive(Debug, Clone)]
pub struct LinearWithLora {
    /// Base weight `[out, in, ...]`. Holds merged deltas while fused.
    weight: Tensor,
    bias: Option<Tensor>,
    /// Registered LoRA adapters, keyed by adapter name.
    adapters: HashMap<String, LoraAdapter>,
    /// Active adapters in activation order.
    active: Vec<String>,
    enabled: bool,
    merged: Vec<MergedAdapter>,
}

impl LinearWithLora {
    /// Create a new LinearWithLora from an existing Linear layer.
    pub fn from_linear(base: Linear) -> Self {
        Self::from_weight(base.weight().clone(), base.bias().cloned())
    }

    /// Wrap a raw weight (and optional bias).
    pub fn from_weight(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight,
            bias,
            adapters: HashMap::new(),
            active: Vec::new(),
            enabled: true,
            merged: Vec::new(),
        }
    }

    /// Create a new LinearWithLora from VarBuilder.
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let base = linear_no_bias(in_features, out_features, vb)?;
        Ok(Self::from_linear(base))
    }

    /// Whether `adapter` produces a delta of this layer's weight shape.
    pub fn fits(&self, adapter: &LoraAdapter) -> bool {
        let dims = self.weight.dims();
        let up_trailing: usize = adapter.lora_b.dims().iter().skip(2).product();
        dims.len() >= 2
            && adapter.lora_b.dims().get(1) == Some(&adapter.rank)
            && adapter.lora_a.dims().first() == Some(&adapter.rank)
            && up_trailing == 1
            && adapter.output_dim() == dims[0]
            && adapter.input_dim() == dims[1..].iter().product::<usize>()
    }

    /// Register a LoRA adapter. It stays inactive until activated.
    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: LoraAdapter) {
        self.adapters.insert(name.into(), adapter);
    }

    /// Remove a registered adapter.
    pub fn remove_adapter(&mut self, name: &str) -> Option<LoraAdapter> {
        self.active.retain(|n| n != name);
        self.adapters.remove(name)
    }

    /// Drop every adapter. Merged deltas stay in the weight.
    pub fn clear_adapters(&mut self) {
        self.adapters.clear();
        self.active.clear();
        self.merged.clear();
    }

    /// Check if an adapter is registered.
    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn adapter(&self, name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(name)
    }

    /// Get list of registered adapter names.
    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    /// Number of registered adapters.
    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    /// Replace the active set. Names not registered here are ignored, since a
    /// network-wide adapter need not touch every layer.
    pub fn set_active_adapters(&mut self, names: &[String], weights: &[f32]) {
        self.active.clear();
        for (name, weight) in names.iter().zip(weights) {
            if let Some(adapter) = self.adapters.get_mut(name) {
                adapter.multiplier = *weight;
                if !self.active.contains(name) {
                    self.active.push(name.clone());
                }
            }
        }
    }

    /// Add one adapter to the active set with the given weight.
    pub fn activate_adapter(&mut self, name: &str, weight: f32) {
        if let Some(adapter) = self.adapters.get_mut(name) {
            adapter.multiplier = weight;
            if !self.active.iter().any(|n| n == name) {
                self.active.push(name.to_string());
            }
        }
    }

    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether any adapter is folded into the weight.
    pub fn is_merged(&self) -> bool {
        !self.merged.is_empty()
    }

    pub fn is_adapter_merged(&self, name: &str) -> bool {
        self.merged.iter().any(|m| m.name == name)
    }

    /// Fold every active, not yet merged adapter into the weight.
    ///
    /// `extra_scale` multiplies each adapter's own scaling. With `safe`, a
    /// merged weight containing NaN or infinity is discarded and the layer
    /// keeps its previous weight.
    pub fn merge(&mut self, extra_scale: f64, safe: bool) -> Result<MergeOutcome> {
        if !self.enabled {
            return Ok(MergeOutcome::Unchanged);
        }
        let pending: Vec<String> = self
            .active
            .iter()
            .filter(|name| !self.is_adapter_merged(name))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }

        let mut weight = self.weight.clone();
        let mut records = Vec::with_capacity(pending.len());
        for name in pending {
            let Some(adapter) = self.adapters.get(&name) else {
                continue;
            };
            let scale = adapter.scaling() * extra_scale;
            let delta = self.delta_for(adapter, scale)?;
            weight = weight.add(&delta)?;
            records.push(MergedAdapter { name, scale });
        }

        if safe && !all_finite(&weight)? {
            return Ok(MergeOutcome::NonFinite);
        }

        let count = records.len();
        self.weight = weight;
        self.merged.extend(records);
        Ok(MergeOutcome::Merged(count))
    }

    /// Subtract every merged delta, most recent first. Returns how many
    /// adapters were unmerged.
    pub fn unmerge(&mut self) -> Result<usize> {
        self.unmerge_latest(self.merged.len())
    }

    /// Subtract the `count` most recent merged deltas.
    pub fn unmerge_latest(&mut self, count: usize) -> Result<usize> {
        let mut restored = 0;
        for _ in 0..count {
            let Some(record) = self.merged.pop() else {
                break;
            };
            let Some(adapter) = self.adapters.get(&record.name) else {
                warn!(adapter = %record.name, "merged adapter no longer registered, delta stays in weight");
                continue;
            };
            let delta = self.delta_for(adapter, record.scale)?;
            self.weight = self.weight.sub(&delta)?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Weight including the deltas of active, unmerged adapters.
    pub fn effective_weight(&self) -> Result<Tensor> {
        let mut weight = self.weight.clone();
        if !self.enabled {
            return Ok(weight);
        }
        for adapter in self.pending_adapters() {
            weight = weight.add(&self.delta_for(adapter, adapter.scaling())?)?;
        }
        Ok(weight)
    }

    /// Move the named adapter's matrices to `device`.
    pub fn adapter_to_device(&mut self, name: &str, device: &Device) -> Result<bool> {
        match self.adapters.get_mut(name) {
            Some(adapter) => {
                adapter.to_device(device)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delta_for(&self, adapter: &LoraAdapter, scale: f64) -> Result<Tensor> {
        adapter
            .delta(self.weight.shape(), scale)?
            .to_device(self.weight.device())?
            .to_dtype(self.weight.dtype())
    }

    fn pending_adapters(&self) -> impl Iterator<Item = &LoraAdapter> {
        self.active
            .iter()
            .filter(|name| !self.is_adapter_merged(name))
            .filter_map(|name| self.adapters.get(name))
    }

    /// Apply LoRA computation: scaling * (x @ lora_a.T @ lora_b.T)
    fn apply_lora(&self, x: &Tensor, adapter: &LoraAdapter) -> Result<Tensor> {
        // x: [..., in_features]
        // lora_a: [rank, in_features]
        // lora_b: [out_features, rank]

        // Handle both 2D and 3D inputs
        let x_dims = x.dims();
        let is_3d = x_dims.len() == 3;

        let x_2d = if is_3d {
            x.reshape((x_dims[0] * x_dims[1], x_dims[2]))?
        } else {
            x.clone()
        };

        let lora_a_t = adapter.lora_a.to_device(x.device())?.t()?;
        let lora_b_t = adapter.lora_b.to_device(x.device())?.t()?;

        let intermediate = x_2d.matmul(&lora_a_t)?;
        let lora_output = intermediate.matmul(&lora_b_t)?;

        let scaling = adapter.scaling();
        let scaled = if (scaling - 1.0).abs() > f64::EPSILON {
            lora_output.affine(scaling, 0.0)?
        } else {
            lora_output
        };

        if is_3d {
            let out_features = scaled.dims()[1];
            scaled.reshape((x_dims[0], x_dims[1], out_features))
        } else {
            Ok(scaled)
        }
    }

    /// Get the weight tensor (including merged deltas).
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for LinearWithLora {
    /// Base projection plus the contribution of every active, unmerged adapter.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.weight.rank() != 2 {
            candle_core::bail!(
                "forward needs a 2D weight, got shape {:?}",
                self.weight.dims()
            );
        }
        let mut output = Linear::new(self.weight.clone(), self.bias.clone()).forward(x)?;
        if self.enabled {
            for adapter in self.pending_adapters() {
                output = output.add(&self.apply_lora(x, adapter)?)?;
            }
        }
        Ok(output)
    }
}

fn all_finite(tensor: &Tensor) -> Result<bool> {
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_linear(in_features: usize, out_features: usize, device: &Device) -> LinearWithLora {
        let weight = Tensor::randn(0.0f32, 1.0, (out_features, in_features), device).unwrap();
        LinearWithLora::from_weight(weight, None)
    }

    fn random_adapter(rank: usize, in_features: usize, out_features: usize, alpha: f32) -> LoraAdapter {
        let device = Device::Cpu;
        let lora_a = Tensor::randn(0.0f32, 0.1, (rank, in_features), &device).unwrap();
        let lora_b = Tensor::randn(0.0f32, 0.1, (out_features, rank), &device).unwrap();
        LoraAdapter::new(lora_a, lora_b, rank, Some(alpha))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_linear_with_lora_no_adapter() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let layer = LinearWithLora::new(64, 32, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let output = layer.forward(&x).unwrap();

        assert_eq!(output.dims(), &[2, 8, 32]);
    }

    #[test]
    fn test_registered_adapter_is_inactive_until_activated() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(64, 32, &device);
        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let base = layer.forward(&x).unwrap();

        layer.register_adapter("test", random_adapter(8, 64, 32, 16.0));
        assert!(layer.has_adapter("test"));
        assert!(layer.active_adapters().is_empty());
        assert!(max_abs_diff(&layer.forward(&x).unwrap(), &base) < f32::EPSILON);

        layer.activate_adapter("test", 1.0);
        let with_lora = layer.forward(&x).unwrap();
        assert_eq!(with_lora.dims(), &[2, 8, 32]);
        assert!(max_abs_diff(&with_lora, &base) > 0.0, "LoRA should modify the output");

        layer.set_enabled(false);
        assert!(max_abs_diff(&layer.forward(&x).unwrap(), &base) < f32::EPSILON);
    }

    #[test]
    fn test_set_active_adapters_ignores_unknown_names() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(16, 8, &device);
        layer.register_adapter("a", random_adapter(4, 16, 8, 4.0));
        layer.register_adapter("b", random_adapter(4, 16, 8, 4.0));

        layer.set_active_adapters(
            &["b".to_string(), "missing".to_string(), "a".to_string()],
            &[0.5, 1.0, 2.0],
        );
        assert_eq!(layer.active_adapters(), &["b".to_string(), "a".to_string()]);
        assert!((layer.adapter("b").unwrap().multiplier - 0.5).abs() < f32::EPSILON);
        assert!((layer.adapter("a").unwrap().multiplier - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_linear_with_lora_scale() {
        let device = Device::Cpu;
        let in_features = 16;
        let out_features = 8;
        let rank = 4;

        let weight = Tensor::zeros((out_features, in_features), DType::F32, &device).unwrap();
        let mut layer = LinearWithLora::from_weight(weight, None);

        // scale = 2.0 (alpha=8, rank=4)
        let lora_a = Tensor::ones((rank, in_features), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((out_features, rank), DType::F32, &device).unwrap();
        let adapter = LoraAdapter::new(lora_a, lora_b, rank, Some(8.0));
        assert!((adapter.scale - 2.0).abs() < f32::EPSILON);
        layer.register_adapter("scaled", adapter);
        layer.activate_adapter("scaled", 1.0);

        // [1]*16 @ [16,4] @ [4,8] * 2 = [128]*8
        let x = Tensor::ones((1, 1, in_features), DType::F32, &device).unwrap();
        let output = layer.forward(&x).unwrap();
        let output_vec: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        assert!(output_vec.iter().all(|&v| (v - 128.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_merge_matches_unmerged_forward() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(32, 16, &device);
        layer.register_adapter("a", random_adapter(4, 32, 16, 8.0));
        layer.register_adapter("b", random_adapter(2, 32, 16, 2.0));
        layer.set_active_adapters(&["a".to_string(), "b".to_string()], &[1.0, 0.5]);

        let x = Tensor::randn(0.0f32, 1.0, (4, 32), &device).unwrap();
        let before = layer.forward(&x).unwrap();
        let original_weight = layer.weight().clone();

        assert_eq!(layer.merge(1.0, false).unwrap(), MergeOutcome::Merged(2));
        assert!(layer.is_merged());
        let fused = layer.forward(&x).unwrap();
        assert!(max_abs_diff(&before, &fused) < 1e-4);

        // Merging again is a no-op.
        assert_eq!(layer.merge(1.0, false).unwrap(), MergeOutcome::Unchanged);

        assert_eq!(layer.unmerge().unwrap(), 2);
        assert!(!layer.is_merged());
        assert!(max_abs_diff(layer.weight(), &original_weight) < 1e-5);
    }

    #[test]
    fn test_merge_with_extra_scale_round_trips() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(8, 8, &device);
        layer.register_adapter("a", random_adapter(2, 8, 8, 2.0));
        layer.activate_adapter("a", 1.0);
        let original = layer.weight().clone();

        layer.merge(0.25, false).unwrap();
        assert!(max_abs_diff(layer.weight(), &original) > 0.0);
        layer.unmerge().unwrap();
        assert!(max_abs_diff(layer.weight(), &original) < 1e-5);
    }

    #[test]
    fn test_disabled_layer_does_not_merge() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(8, 8, &device);
        layer.register_adapter("a", random_adapter(2, 8, 8, 2.0));
        layer.activate_adapter("a", 1.0);
        layer.set_enabled(false);
        assert_eq!(layer.merge(1.0, false).unwrap(), MergeOutcome::Unchanged);
        assert!(!layer.is_merged());
    }

    #[test]
    fn test_safe_merge_skips_non_finite() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(4, 4, &device);
        let lora_a = Tensor::new(&[[f32::NAN, 0.0, 0.0, 0.0]], &device).unwrap();
        let lora_b = Tensor::ones((4, 1), DType::F32, &device).unwrap();
        layer.register_adapter("bad", LoraAdapter::new(lora_a, lora_b, 1, None));
        layer.activate_adapter("bad", 1.0);
        let original = layer.weight().clone();

        assert_eq!(layer.merge(1.0, true).unwrap(), MergeOutcome::NonFinite);
        assert!(!layer.is_merged());
        assert!(max_abs_diff(layer.weight(), &original) < f32::EPSILON);

        // Unsafe merge goes through.
        assert_eq!(layer.merge(1.0, false).unwrap(), MergeOutcome::Merged(1));
    }

    #[test]
    fn test_conv_weight_merge() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((6, 3, 3, 3), DType::F32, &device).unwrap();
        let mut layer = LinearWithLora::from_weight(weight, None);

        let lora_a = Tensor::ones((2, 3, 3, 3), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((6, 2, 1, 1), DType::F32, &device).unwrap();
        let adapter = LoraAdapter::new(lora_a, lora_b, 2, None);
        assert!(layer.fits(&adapter));
        layer.register_adapter("conv", adapter);
        layer.activate_adapter("conv", 1.0);

        layer.merge(1.0, false).unwrap();
        let values: Vec<f32> = layer.weight().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 2.0).abs() < 1e-6));

        let x = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        assert!(layer.forward(&x).is_err());
    }

    #[test]
    fn test_fits_rejects_wrong_shapes() {
        let device = Device::Cpu;
        let layer = create_test_linear(64, 32, &device);
        assert!(layer.fits(&random_adapter(8, 64, 32, 8.0)));
        assert!(!layer.fits(&random_adapter(8, 32, 32, 8.0)));
        assert!(!layer.fits(&random_adapter(8, 64, 16, 8.0)));
    }

    #[test]
    fn test_remove_adapter() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(64, 32, &device);
        layer.register_adapter("test", random_adapter(8, 64, 32, 16.0));
        layer.activate_adapter("test", 1.0);

        let removed = layer.remove_adapter("test");
        assert!(removed.is_some());
        assert!(!layer.has_adapter("test"));
        assert!(layer.active_adapters().is_empty());
        assert_eq!(layer.num_adapters(), 0);
    }

    #[test]
    fn test_clear_adapters_keeps_merged_weight() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(8, 8, &device);
        layer.register_adapter("a", random_adapter(2, 8, 8, 2.0));
        layer.activate_adapter("a", 1.0);
        layer.merge(1.0, false).unwrap();
        let fused = layer.weight().clone();

        layer.clear_adapters();
        assert_eq!(layer.num_adapters(), 0);
        assert!(!layer.is_merged());
        assert!(max_abs_diff(layer.weight(), &fused) < f32::EPSILON);
    }

    #[test]
    fn test_adapter_names() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(64, 32, &device);
        layer.register_adapter("alpha", random_adapter(8, 64, 32, 16.0));
        layer.register_adapter("beta", random_adapter(8, 64, 32, 16.0));

        let names = layer.adapter_names();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"alpha"));
        assert!(names.contains(&"beta"));
    }
}
