//! Scale-group discovery and layer fusion for Mixtral-style sparse MoE decoders.
//!
//! A loaded [`models::MixtralForCausalLM`] keeps all of its parameters in a
//! [`weights::WeightArena`]. From there:
//!
//! - [`quantization::discover_scale_groups`] lists, per decoder layer, the
//!   operators that must share an activation-aware quantization scale;
//! - [`fused::fuse_layers`] swaps the decoder layers for fused blocks that
//!   compute the same function.

pub mod config;
pub mod error;
pub mod fused;
pub mod layers;
pub mod logging;
pub mod models;
pub mod moe;
pub mod quantization;
pub mod weights;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{MixtralConfig, ModelConfig, MAX_NEW_TOKENS_KEY};
pub use error::{FuseError, Result};
pub use fused::{fuse_layers, FusedBlock, FusedModel};
pub use models::{MixtralForCausalLM, MoeDecoderLayer};
pub use quantization::{discover_scale_groups, AwqModel, InputFeatures, ScaleGroup};
pub use weights::{WeightArena, WeightHandle};
