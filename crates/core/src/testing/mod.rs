//! Shared test utilities for mixfuse-core.
//!
//! Tiny Mixtral configurations and deterministic weights, small enough to
//! run whole-model forward passes in unit tests.

mod tiny_config;
mod weights;

pub use tiny_config::{tiny_gqa_mixtral_config, tiny_mixtral_config, tiny_top2_mixtral_config};
pub use weights::{deterministic_tensor, tiny_var_builder};
