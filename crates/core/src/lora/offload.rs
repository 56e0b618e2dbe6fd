//! CPU offload hooks and their suspension around weight loading.
//!
//! Offloading moves components between devices behind the caller's back.
//! While adapters are injected the hooks are removed, then the same
//! offload mode is re-enabled once loading finishes, on success or error.

use tracing::info;

use super::network::LoraNetwork;

/// Offload hook installed on a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadHook {
    /// Whole component moved to the accelerator on use.
    ModelCpuOffload,
    /// Submodules streamed to the accelerator one at a time.
    SequentialCpuOffload,
}

/// Which offload modes were active before suspension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendedOffload {
    pub model_cpu_offload: bool,
    pub sequential_cpu_offload: bool,
}

impl SuspendedOffload {
    pub fn is_empty(&self) -> bool {
        !self.model_cpu_offload && !self.sequential_cpu_offload
    }
}

/// A pipeline whose components may carry offload hooks.
pub trait OffloadHost {
    /// Components that can carry hooks.
    fn offload_components(&mut self) -> Vec<&mut LoraNetwork>;

    /// Install model-level offloading on every component.
    fn enable_model_cpu_offload(&mut self);

    /// Install sequential offloading on every component.
    fn enable_sequential_cpu_offload(&mut self);
}

/// Remove every hook, remembering which modes were in use.
pub fn suspend_offloading<H: OffloadHost + ?Sized>(host: &mut H) -> SuspendedOffload {
    let mut suspended = SuspendedOffload::default();
    for component in host.offload_components() {
        match component.take_offload_hook() {
            Some(OffloadHook::ModelCpuOffload) => suspended.model_cpu_offload = true,
            Some(OffloadHook::SequentialCpuOffload) => suspended.sequential_cpu_offload = true,
            None => {}
        }
    }
    if !suspended.is_empty() {
        info!(
            ?suspended,
            "offload hooks removed for LoRA loading, they will be re-applied afterwards"
        );
    }
    suspended
}

/// Re-enable the offload mode recorded by [`suspend_offloading`].
pub fn restore_offloading<H: OffloadHost + ?Sized>(host: &mut H, suspended: SuspendedOffload) {
    if suspended.model_cpu_offload {
        host.enable_model_cpu_offload();
    } else if suspended.sequential_cpu_offload {
        host.enable_sequential_cpu_offload();
    }
}

/// Run `f` with offloading suspended. Hooks come back whether `f` succeeds or fails.
pub fn with_offloading_suspended<H, T, E, F>(host: &mut H, f: F) -> Result<T, E>
where
    H: OffloadHost + ?Sized,
    F: FnOnce(&mut H) -> Result<T, E>,
{
    let suspended = suspend_offloading(host);
    let result = f(host);
    restore_offloading(host, suspended);
    result
}
