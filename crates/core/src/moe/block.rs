use candle_core::Tensor;
use candle_nn::{Activation, VarBuilder};

use super::expert::{Expert, ExpertMlp};
use super::router::TopKRouter;
use crate::config::MixtralConfig;
use crate::error::{FuseError, Result};
use crate::quantization::capture::{expert_key, InputFeatures};
use crate::weights::WeightArena;

/// Sparse MoE block: a router and an ordered list of experts.
///
/// Expert order is significant: the router's expert indices address this
/// list directly, and fusion replaces entries in place.
#[derive(Debug, Clone)]
pub struct SparseMoeBlock {
    router: TopKRouter,
    experts: Vec<Expert>,
}

impl SparseMoeBlock {
    pub fn new(router: TopKRouter, experts: Vec<Expert>) -> Self {
        Self { router, experts }
    }

    pub fn load(
        arena: &mut WeightArena,
        cfg: &MixtralConfig,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let router = TopKRouter::load(
            arena,
            cfg.base.hidden_size,
            cfg.num_local_experts,
            cfg.num_experts_per_tok,
            vb.pp("gate"),
        )?;

        let vb_experts = vb.pp("experts");
        let mut experts = Vec::with_capacity(cfg.num_local_experts);
        for i in 0..cfg.num_local_experts {
            experts.push(Expert::Mlp(ExpertMlp::load(
                arena,
                cfg.base.hidden_size,
                cfg.base.intermediate_size,
                act,
                vb_experts.pp(i),
            )?));
        }

        Ok(Self::new(router, experts))
    }

    pub fn router(&self) -> &TopKRouter {
        &self.router
    }

    pub fn experts(&self) -> &[Expert] {
        &self.experts
    }

    /// Mutable view of the expert list; its length cannot change.
    pub fn experts_mut(&mut self) -> &mut [Expert] {
        &mut self.experts
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn forward(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        self.forward_impl(xs, arena, None)
    }

    /// Forward pass that also records, for every expert that receives tokens,
    /// the inputs of `w1` and `w2` and the routing weights.
    pub fn forward_with_capture(
        &self,
        xs: &Tensor,
        arena: &WeightArena,
        input_feat: &mut InputFeatures,
    ) -> Result<Tensor> {
        self.forward_impl(xs, arena, Some(input_feat))
    }

    fn forward_impl(
        &self,
        xs: &Tensor,
        arena: &WeightArena,
        mut capture: Option<&mut InputFeatures>,
    ) -> Result<Tensor> {
        let input_shape = xs.dims().to_vec();
        let hidden_size = xs.dim(candle_core::D::Minus1)?;
        let num_tokens = xs.elem_count() / hidden_size;
        let xs_2d = xs.reshape((num_tokens, hidden_size))?;

        let (routing_weights, selected_experts) = self.router.route(&xs_2d, arena)?;
        let dispatch = self.router.dispatch(&routing_weights, &selected_experts)?;

        let mut output = xs_2d.zeros_like()?;
        for entry in dispatch.iter().filter(|d| !d.is_empty()) {
            let expert = self.experts.get(entry.expert).ok_or_else(|| {
                FuseError::StructuralMismatch(format!(
                    "router selected expert {} but the block has {}",
                    entry.expert,
                    self.experts.len()
                ))
            })?;

            let token_idx = entry.token_index_tensor(xs.device())?;
            let current_state = xs_2d.index_select(&token_idx, 0)?;
            let weights = entry.routing_weight_tensor(xs.dtype(), xs.device())?;

            let expert_out = match capture.as_deref_mut() {
                Some(input_feat) => {
                    input_feat.record(&expert_key(entry.expert, "w1"), &current_state)?;
                    input_feat.record(&expert_key(entry.expert, "routing_weights"), &weights)?;
                    let hidden = expert.gated_hidden(&current_state, arena)?;
                    input_feat.record(&expert_key(entry.expert, "w2"), &hidden)?;
                    expert.project_down(&hidden, &weights, arena)?
                }
                None => expert.forward(&current_state, &weights, arena)?,
            };

            output = output.index_add(&token_idx, &expert_out, 0)?;
        }

        Ok(output.reshape(input_shape)?)
    }
}
