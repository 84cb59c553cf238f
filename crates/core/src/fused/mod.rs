//! Fused inference representation of a MoE decoder.
//!
//! - [`qkv`]: single projection replacing q/k/v
//! - [`block`]: fused decoder block with KV cache
//! - [`model`]: fused model body
//! - [`fuser`]: the layer-by-layer conversion

pub mod block;
pub mod fuser;
pub mod model;
pub mod qkv;

pub use block::FusedBlock;
pub use fuser::{check_fusable, fuse_layer, fuse_layers};
pub use model::FusedModel;
pub use qkv::{fuse_qkv, FusedQkv};
