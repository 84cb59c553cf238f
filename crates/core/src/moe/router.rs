//! Top-k softmax router for sparse MoE blocks.
//!
//! Softmax runs in f32 over all experts, the top-k probabilities are kept
//! and (for Mixtral) renormalised to sum to one per token.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;

use crate::error::Result;
use crate::layers::Linear;
use crate::weights::{WeightArena, WeightHandle};

/// Tokens routed to one expert together with their routing weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertDispatch {
    pub expert: usize,
    pub token_indices: Vec<u32>,
    pub routing_weights: Vec<f32>,
}

impl ExpertDispatch {
    fn new(expert: usize) -> Self {
        Self {
            expert,
            token_indices: Vec::new(),
            routing_weights: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token_indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.token_indices.len()
    }

    pub fn token_index_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.token_indices,
            self.token_indices.len(),
            device,
        )?)
    }

    /// Routing weights as a `[tokens, 1]` column, broadcastable over features.
    pub fn routing_weight_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let weights = Tensor::from_slice(
            &self.routing_weights,
            (self.routing_weights.len(), 1),
            device,
        )?;
        Ok(weights.to_dtype(dtype)?)
    }
}

/// Top-k router: `gate` projects hidden states to one logit per expert.
#[derive(Debug, Clone)]
pub struct TopKRouter {
    gate: Linear,
    num_experts: usize,
    top_k: usize,
    renormalize: bool,
}

impl TopKRouter {
    pub fn new(gate: Linear, num_experts: usize, top_k: usize, renormalize: bool) -> Self {
        Self {
            gate,
            num_experts,
            top_k,
            renormalize,
        }
    }

    pub fn load(
        arena: &mut WeightArena,
        hidden_size: usize,
        num_experts: usize,
        top_k: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gate = Linear::load_no_bias(arena, hidden_size, num_experts, vb)?;
        Ok(Self::new(gate, num_experts, top_k, true))
    }

    pub fn gate_weight(&self) -> WeightHandle {
        self.gate.weight()
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Route `[num_tokens, hidden]` states.
    ///
    /// Returns `(routing_weights, selected_experts)`, both `[num_tokens, top_k]`;
    /// weights are in the dtype of `hidden_states`, experts are `u32`.
    pub fn route(&self, hidden_states: &Tensor, arena: &WeightArena) -> Result<(Tensor, Tensor)> {
        let router_logits = self.gate.forward(hidden_states, arena)?;
        let routing_probs = candle_nn::ops::softmax_last_dim(&router_logits.to_dtype(DType::F32)?)?;
        let (top_k_weights, top_k_indices) = top_k_with_indices(&routing_probs, self.top_k)?;

        let weights = if self.renormalize {
            let sum = top_k_weights.sum_keepdim(D::Minus1)?;
            top_k_weights.broadcast_div(&sum)?
        } else {
            top_k_weights
        };
        Ok((weights.to_dtype(hidden_states.dtype())?, top_k_indices))
    }

    /// Group routed tokens per expert, one entry per expert in index order.
    ///
    /// Within an expert, tokens are ordered by top-k slot first and token
    /// index second.
    pub fn dispatch(&self, weights: &Tensor, selected: &Tensor) -> Result<Vec<ExpertDispatch>> {
        let weights: Vec<Vec<f32>> = weights.to_dtype(DType::F32)?.to_vec2()?;
        let selected: Vec<Vec<u32>> = selected.to_vec2()?;
        let slots = selected.first().map_or(0, Vec::len);

        let mut dispatch: Vec<ExpertDispatch> =
            (0..self.num_experts).map(ExpertDispatch::new).collect();
        for slot in 0..slots {
            for (token, experts) in selected.iter().enumerate() {
                let expert = experts[slot] as usize;
                if let Some(entry) = dispatch.get_mut(expert) {
                    entry.token_indices.push(token as u32);
                    entry.routing_weights.push(weights[token][slot]);
                }
            }
        }
        Ok(dispatch)
    }
}

/// Top-k values and their indices along the last dimension, largest first.
fn top_k_with_indices(tensor: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let dim = tensor.rank() - 1;
    let k = k.min(tensor.dim(dim)?);

    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_k_indices = sorted_indices.narrow(dim, 0, k)?.contiguous()?;
    let top_k_values = tensor.contiguous()?.gather(&top_k_indices, dim)?;

    Ok((top_k_values, top_k_indices))
}
