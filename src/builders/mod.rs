//! Builders assembling runtime components from configuration.

pub mod core_builder;

pub use core_builder::{build_runtime_core, RuntimeCore};
