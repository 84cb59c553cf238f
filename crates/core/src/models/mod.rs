//! Decoder models and the structural interface the generic algorithms use.

pub mod mixtral;

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::layers::{LayerKwargs, Linear, RmsNorm};
use crate::moe::SparseMoeBlock;
use crate::weights::WeightArena;

pub use mixtral::{
    MixtralAttention, MixtralDecoderLayer, MixtralForCausalLM, MixtralModel, ModelBody,
};

/// A pre-norm decoder layer with GQA attention and a sparse MoE feed-forward.
///
/// Scale-group discovery and layer fusion only see layers through this trait.
pub trait MoeDecoderLayer {
    fn q_proj(&self) -> &Linear;
    fn k_proj(&self) -> &Linear;
    fn v_proj(&self) -> &Linear;
    fn o_proj(&self) -> &Linear;

    fn input_layernorm(&self) -> &RmsNorm;
    fn post_attention_layernorm(&self) -> &RmsNorm;

    fn moe(&self) -> &SparseMoeBlock;
    fn moe_mut(&mut self) -> &mut SparseMoeBlock;

    /// Consume the layer, keeping its MoE block.
    fn into_moe(self) -> SparseMoeBlock
    where
        Self: Sized;

    fn num_heads(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn head_dim(&self) -> usize;

    /// Attention sub-block alone (no norm, no residual) on `xs`.
    fn attention_forward(
        &self,
        xs: &Tensor,
        kwargs: &LayerKwargs,
        arena: &WeightArena,
    ) -> Result<Tensor>;

    /// Device the layer's parameters live on.
    fn device(&self, arena: &WeightArena) -> Result<Device> {
        Ok(arena.get(self.q_proj().weight())?.device().clone())
    }
}
