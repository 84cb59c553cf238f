//! Activation-aware quantization support.
//!
//! - [`capture`]: recording the inputs of a layer's operators
//! - [`groups`]: discovering which operators share a quantization scale
//! - [`scale`]: folding a scale vector into a group's weights
//! - [`adapter`]: per-architecture hooks ([`AwqModel`])

pub mod adapter;
pub mod capture;
pub mod groups;
pub mod scale;

pub use adapter::{ActScaling, AwqModel};
pub use capture::{expert_key, InputFeatures};
pub use groups::{
    compatible_for_fusion, discover_scale_groups, GroupKind, InspectTarget, Operator, OperatorRef,
    ScaleGroup,
};
pub use scale::apply_scale;
