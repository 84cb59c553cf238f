//! Mixture of Experts (MoE) module.
//!
//! ## Submodules
//!
//! - [`router`]: Top-K routing with softmax normalization
//! - [`expert`]: Gate/up/down experts and their fused replacement
//! - [`block`]: Sparse MoE block combining a router and its experts

mod block;
mod expert;
mod router;

pub use block::SparseMoeBlock;
pub use expert::{Expert, ExpertMlp, FusedExpert, FusedMlp};
pub use router::{ExpertDispatch, TopKRouter};
