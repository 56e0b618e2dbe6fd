//! Shared test utilities for difflora-core.
//!
//! Tiny UNet-like and CLIP-like networks plus helpers that build LoRA
//! checkpoints in each dialect.

mod checkpoints;
mod tiny_networks;

pub use checkpoints::{kohya_conv_pair, kohya_pair, peft_pair, tiny_kohya_checkpoint};
pub use tiny_networks::{
    tiny_clip_network, tiny_manager, tiny_unet_network, HIDDEN, TIME_EMBED,
};
