//! Scale-group discovery for one MoE decoder layer.
//!
//! A scale group is a producer operator plus the operators that consume its
//! output jointly. Activation-aware quantization searches one per-channel
//! scale per group, folds its inverse into the producer and the scale itself
//! into the members (see [`super::scale::apply_scale`]).
//!
//! Groups of a layer, in order:
//!
//! 1. `input_layernorm` -> q/k/v projections
//! 2. `v_proj` -> `o_proj`, only when [`compatible_for_fusion`] holds
//! 3. for each expert `i`: `post_attention_layernorm` -> `w1`, `w3`
//! 4. for each expert `i`: `w3` -> `w2`
//!
//! (3 and 4 interleave per expert.)

use candle_core::Tensor;
use tracing::debug;

use super::capture::{expert_key, InputFeatures, O_PROJ_KEY, Q_PROJ_KEY};
use crate::error::{FuseError, Result};
use crate::layers::{LayerKwargs, Linear, RmsNorm};
use crate::models::MoeDecoderLayer;
use crate::weights::WeightArena;

/// Position of a group within its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    AttentionInput,
    AttentionOutput,
    ExpertGateUp { expert: usize },
    ExpertDown { expert: usize },
}

/// Producer or member operator of a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    Norm(RmsNorm),
    Linear(Linear),
}

/// An operator together with its path inside the decoder layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorRef {
    pub name: String,
    pub op: Operator,
}

impl OperatorRef {
    fn norm(name: impl Into<String>, norm: &RmsNorm) -> Self {
        Self {
            name: name.into(),
            op: Operator::Norm(*norm),
        }
    }

    fn linear(name: impl Into<String>, linear: &Linear) -> Self {
        Self {
            name: name.into(),
            op: Operator::Linear(*linear),
        }
    }

    pub fn as_linear(&self) -> Option<&Linear> {
        match &self.op {
            Operator::Linear(linear) => Some(linear),
            Operator::Norm(_) => None,
        }
    }
}

/// What to run when evaluating the effect of a scale on a group.
#[derive(Debug, Clone)]
pub enum InspectTarget {
    /// The whole attention sub-block, called with the layer's kwargs.
    Attention { kwargs: LayerKwargs },
    /// One expert, gated by the routing weights of the tokens it received.
    Expert { index: usize, routing_weights: Tensor },
}

#[derive(Debug, Clone)]
pub struct ScaleGroup {
    pub kind: GroupKind,
    pub prev_op: OperatorRef,
    pub layers: Vec<OperatorRef>,
    /// Captured input activation shared by `layers`.
    pub input: Tensor,
    pub inspect: Option<InspectTarget>,
}

impl ScaleGroup {
    /// Run the inspection target (or the first member when there is none)
    /// on the group's input.
    pub fn inspect_forward<L: MoeDecoderLayer>(
        &self,
        layer: &L,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        match &self.inspect {
            Some(InspectTarget::Attention { kwargs }) => {
                layer.attention_forward(&self.input, kwargs, arena)
            }
            Some(InspectTarget::Expert {
                index,
                routing_weights,
            }) => {
                let expert = layer.moe().experts().get(*index).ok_or_else(|| {
                    FuseError::StructuralMismatch(format!("layer has no expert {index}"))
                })?;
                expert.forward(&self.input, routing_weights, arena)
            }
            None => {
                let member = self
                    .layers
                    .first()
                    .and_then(OperatorRef::as_linear)
                    .ok_or_else(|| {
                        FuseError::StructuralMismatch("group has no linear member".to_string())
                    })?;
                member.forward(&self.input, arena)
            }
        }
    }
}

/// Whether two weight shapes allow folding a scale from one into the other.
///
/// Exact shape equality. Under GQA `v_proj` and `o_proj` differ and the
/// attention-output group is skipped.
pub fn compatible_for_fusion(a: &[usize], b: &[usize]) -> bool {
    a == b
}

/// Ordered scale groups of `layer`.
///
/// `input_feat` must hold the inputs recorded by a capturing forward pass
/// (see [`super::capture`]); a missing entry is
/// [`FuseError::MissingActivation`].
pub fn discover_scale_groups<L: MoeDecoderLayer>(
    layer: &L,
    arena: &WeightArena,
    input_feat: &InputFeatures,
    module_kwargs: &LayerKwargs,
) -> Result<Vec<ScaleGroup>> {
    let num_experts = layer.moe().num_experts();
    let mut groups = Vec::with_capacity(2 * num_experts + 2);

    groups.push(ScaleGroup {
        kind: GroupKind::AttentionInput,
        prev_op: OperatorRef::norm("input_layernorm", layer.input_layernorm()),
        layers: vec![
            OperatorRef::linear(Q_PROJ_KEY, layer.q_proj()),
            OperatorRef::linear("self_attn.k_proj", layer.k_proj()),
            OperatorRef::linear("self_attn.v_proj", layer.v_proj()),
        ],
        input: input_feat.get(Q_PROJ_KEY)?.clone(),
        inspect: Some(InspectTarget::Attention {
            kwargs: module_kwargs.clone(),
        }),
    });

    let v_shape = arena.dims(layer.v_proj().weight())?;
    let o_shape = arena.dims(layer.o_proj().weight())?;
    if compatible_for_fusion(v_shape, o_shape) {
        groups.push(ScaleGroup {
            kind: GroupKind::AttentionOutput,
            prev_op: OperatorRef::linear("self_attn.v_proj", layer.v_proj()),
            layers: vec![OperatorRef::linear(O_PROJ_KEY, layer.o_proj())],
            input: input_feat.get(O_PROJ_KEY)?.clone(),
            inspect: None,
        });
    } else {
        debug!(
            ?v_shape,
            ?o_shape,
            "v_proj and o_proj shapes differ, skipping attention output group"
        );
    }

    for (i, expert) in layer.moe().experts().iter().enumerate() {
        groups.push(ScaleGroup {
            kind: GroupKind::ExpertGateUp { expert: i },
            prev_op: OperatorRef::norm(
                "post_attention_layernorm",
                layer.post_attention_layernorm(),
            ),
            layers: vec![
                OperatorRef::linear(expert_key(i, "w1"), expert.gate_proj()),
                OperatorRef::linear(expert_key(i, "w3"), expert.up_proj()),
            ],
            input: input_feat.get(&expert_key(i, "w1"))?.clone(),
            inspect: Some(InspectTarget::Expert {
                index: i,
                routing_weights: input_feat
                    .get(&expert_key(i, "routing_weights"))?
                    .clone(),
            }),
        });

        groups.push(ScaleGroup {
            kind: GroupKind::ExpertDown { expert: i },
            prev_op: OperatorRef::linear(expert_key(i, "w3"), expert.up_proj()),
            layers: vec![OperatorRef::linear(expert_key(i, "w2"), expert.down_proj())],
            input: input_feat.get(&expert_key(i, "w2"))?.clone(),
            inspect: None,
        });
    }

    debug!(groups = groups.len(), experts = num_experts, "discovered scale groups");
    Ok(groups)
}
