//! LoRA (Low-Rank Adaptation) support for diffusion pipelines.
//!
//! This module normalizes LoRA checkpoints from the common training tools
//! into one canonical form and injects them into UNet and text-encoder
//! networks as named, individually activatable adapters.

pub mod convert;
mod linear;
mod loader;
mod manager;
mod network;
mod offload;
mod types;

pub use convert::{
    detect_dialect, normalize, partition_by_target, ConvertError, Dialect, NormalizedCheckpoint,
    TargetPartition,
};
pub use linear::{LinearWithLora, MergeOutcome};
pub use loader::{
    pack_weights, write_lora_layers, CheckpointSource, LoadOptions, LoraLoadError, LoraLoader,
};
pub use manager::{
    FuseOptions, FuseSummary, LoadSummary, LoraManager, LoraManagerConfig, LoraManagerError,
    SaveOptions,
};
pub use network::{
    ClipTextModules, FuseReport, InjectError, LoadReport, LoraNetwork, PreparedAdapter,
    SubmoduleEnumerator, UNetModules,
};
pub use offload::{
    restore_offloading, suspend_offloading, with_offloading_suspended, OffloadHook, OffloadHost,
    SuspendedOffload,
};
pub use types::{
    InvalidTargetName, LoraAdapter, LoraComponent, LoraModel, NetworkAlphas, Rank, StateDict,
    TargetKind, LORA_WEIGHT_NAME, LORA_WEIGHT_NAME_SAFE,
};
