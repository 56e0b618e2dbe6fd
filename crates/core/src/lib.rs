pub mod config;
pub mod lora;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
