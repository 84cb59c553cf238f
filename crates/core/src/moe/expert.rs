//! MoE experts: the gate/up/down triple and its fused replacement.
//!
//! Both compute `routing_weights ⊙ down(act(gate(x)) * up(x))`. Routing
//! weights are a call-time argument because routing is decided per token.

use candle_core::Tensor;
use candle_nn::{Activation, Module, VarBuilder};

use crate::error::Result;
use crate::layers::Linear;
use crate::weights::WeightArena;

/// Unfused expert: `w1` = gate, `w2` = down, `w3` = up.
#[derive(Debug, Clone)]
pub struct ExpertMlp {
    w1: Linear,
    w2: Linear,
    w3: Linear,
    act: Activation,
}

impl ExpertMlp {
    pub fn new(w1: Linear, w2: Linear, w3: Linear, act: Activation) -> Self {
        Self { w1, w2, w3, act }
    }

    pub fn load(
        arena: &mut WeightArena,
        hidden_size: usize,
        intermediate_size: usize,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let w1 = Linear::load_no_bias(arena, hidden_size, intermediate_size, vb.pp("w1"))?;
        let w2 = Linear::load_no_bias(arena, intermediate_size, hidden_size, vb.pp("w2"))?;
        let w3 = Linear::load_no_bias(arena, hidden_size, intermediate_size, vb.pp("w3"))?;
        Ok(Self::new(w1, w2, w3, act))
    }

    pub fn w1(&self) -> &Linear {
        &self.w1
    }

    pub fn w2(&self) -> &Linear {
        &self.w2
    }

    pub fn w3(&self) -> &Linear {
        &self.w3
    }

    pub fn act(&self) -> Activation {
        self.act
    }

    /// Input of `w2`: `act(w1(x)) * w3(x)`.
    pub fn gated_hidden(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let gate = self.act.forward(&self.w1.forward(xs, arena)?)?;
        let up = self.w3.forward(xs, arena)?;
        Ok((gate * up)?)
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        routing_weights: &Tensor,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        let hidden = self.gated_hidden(xs, arena)?;
        let out = self.w2.forward(&hidden, arena)?;
        Ok(routing_weights.broadcast_mul(&out)?)
    }
}

/// SwiGLU feed-forward over arena-shared gate/down/up projections.
#[derive(Debug, Clone)]
pub struct FusedMlp {
    gate_proj: Linear,
    down_proj: Linear,
    up_proj: Linear,
}

impl FusedMlp {
    pub fn new(gate_proj: Linear, down_proj: Linear, up_proj: Linear) -> Self {
        Self {
            gate_proj,
            down_proj,
            up_proj,
        }
    }

    pub fn gate_proj(&self) -> &Linear {
        &self.gate_proj
    }

    pub fn down_proj(&self) -> &Linear {
        &self.down_proj
    }

    pub fn up_proj(&self) -> &Linear {
        &self.up_proj
    }

    fn gated_hidden(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs, arena)?)?;
        let up = self.up_proj.forward(xs, arena)?;
        Ok(gate.mul(&up)?)
    }

    pub fn forward(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let hidden = self.gated_hidden(xs, arena)?;
        self.down_proj.forward(&hidden, arena)
    }
}

/// Fused replacement of one expert, gated by routing weights at call time.
#[derive(Debug, Clone)]
pub struct FusedExpert {
    fused_mlp: FusedMlp,
}

impl FusedExpert {
    pub fn new(gate_proj: Linear, down_proj: Linear, up_proj: Linear) -> Self {
        Self {
            fused_mlp: FusedMlp::new(gate_proj, down_proj, up_proj),
        }
    }

    pub fn fused_mlp(&self) -> &FusedMlp {
        &self.fused_mlp
    }

    /// `routing_weights ⊙ fused_mlp(xs)`; `routing_weights` is `[tokens, 1]`
    /// (or anything broadcastable over the feature dimension).
    pub fn forward(
        &self,
        xs: &Tensor,
        routing_weights: &Tensor,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        let out = self.fused_mlp.forward(xs, arena)?;
        Ok(routing_weights.broadcast_mul(&out)?)
    }
}

/// An entry of a MoE block's expert list.
#[derive(Debug, Clone)]
pub enum Expert {
    Mlp(ExpertMlp),
    Fused(FusedExpert),
}

impl Expert {
    pub fn gate_proj(&self) -> &Linear {
        match self {
            Self::Mlp(mlp) => mlp.w1(),
            Self::Fused(fused) => fused.fused_mlp().gate_proj(),
        }
    }

    pub fn down_proj(&self) -> &Linear {
        match self {
            Self::Mlp(mlp) => mlp.w2(),
            Self::Fused(fused) => fused.fused_mlp().down_proj(),
        }
    }

    pub fn up_proj(&self) -> &Linear {
        match self {
            Self::Mlp(mlp) => mlp.w3(),
            Self::Fused(fused) => fused.fused_mlp().up_proj(),
        }
    }

    pub fn is_fused(&self) -> bool {
        matches!(self, Self::Fused(_))
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        routing_weights: &Tensor,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        match self {
            Self::Mlp(mlp) => mlp.forward(xs, routing_weights, arena),
            Self::Fused(fused) => fused.forward(xs, routing_weights, arena),
        }
    }

    /// Input of the down projection for `xs`.
    pub(crate) fn gated_hidden(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        match self {
            Self::Mlp(mlp) => mlp.gated_hidden(xs, arena),
            Self::Fused(fused) => fused.fused_mlp().gated_hidden(xs, arena),
        }
    }

    /// `routing_weights ⊙ down(hidden)`.
    pub(crate) fn project_down(
        &self,
        hidden: &Tensor,
        routing_weights: &Tensor,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        let out = self.down_proj().forward(hidden, arena)?;
        Ok(routing_weights.broadcast_mul(&out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::deterministic_tensor;
    use candle_core::Device;

    fn expert(arena: &mut WeightArena, hidden: usize, inter: usize) -> ExpertMlp {
        let device = Device::Cpu;
        let w1 = arena.insert("w1", deterministic_tensor((inter, hidden), 1, 0.5, &device));
        let w2 = arena.insert("w2", deterministic_tensor((hidden, inter), 2, 0.5, &device));
        let w3 = arena.insert("w3", deterministic_tensor((inter, hidden), 3, 0.5, &device));
        ExpertMlp::new(
            Linear::new(w1, None),
            Linear::new(w2, None),
            Linear::new(w3, None),
            Activation::Silu,
        )
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn fused_expert_matches_unfused() {
        let device = Device::Cpu;
        let mut arena = WeightArena::new();
        let mlp = expert(&mut arena, 8, 16);
        let fused = FusedExpert::new(*mlp.w1(), *mlp.w2(), *mlp.w3());

        let xs = deterministic_tensor((5, 8), 10, 1.0, &device);
        let rw = deterministic_tensor((5, 1), 11, 1.0, &device);

        let a = mlp.forward(&xs, &rw, &arena).unwrap();
        let b = fused.forward(&xs, &rw, &arena).unwrap();
        assert_eq!(b.dims(), &[5, 8]);
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn routing_weight_scales_output() {
        let device = Device::Cpu;
        let mut arena = WeightArena::new();
        let mlp = expert(&mut arena, 8, 16);
        let fused = FusedExpert::new(*mlp.w1(), *mlp.w2(), *mlp.w3());

        let xs = deterministic_tensor((3, 8), 4, 1.0, &device);
        let ones = Tensor::ones((3, 1), candle_core::DType::F32, &device).unwrap();
        let halves = (&ones * 0.5).unwrap();

        let full = fused.forward(&xs, &ones, &arena).unwrap();
        let half = fused.forward(&xs, &halves, &arena).unwrap();
        let expected = (&full * 0.5).unwrap();
        assert!(max_abs_diff(&half, &expected) < 1e-6);

        let plain = fused.fused_mlp().forward(&xs, &arena).unwrap();
        assert!(max_abs_diff(&full, &plain) < 1e-6);
    }

    #[test]
    fn gated_hidden_then_down_equals_forward() {
        let device = Device::Cpu;
        let mut arena = WeightArena::new();
        let expert = Expert::Mlp(expert(&mut arena, 8, 16));

        let xs = deterministic_tensor((2, 8), 6, 1.0, &device);
        let rw = deterministic_tensor((2, 1), 7, 1.0, &device);
        let hidden = expert.gated_hidden(&xs, &arena).unwrap();
        assert_eq!(hidden.dims(), &[2, 16]);

        let split = expert.project_down(&hidden, &rw, &arena).unwrap();
        let whole = expert.forward(&xs, &rw, &arena).unwrap();
        assert!(max_abs_diff(&split, &whole) < 1e-6);
    }

    #[test]
    fn accessors_agree_across_variants() {
        let mut arena = WeightArena::new();
        let mlp = expert(&mut arena, 4, 8);
        let fused = Expert::Fused(FusedExpert::new(*mlp.w1(), *mlp.w2(), *mlp.w3()));
        let original = Expert::Mlp(mlp);

        assert!(!original.is_fused());
        assert!(fused.is_fused());
        assert_eq!(original.gate_proj(), fused.gate_proj());
        assert_eq!(original.down_proj(), fused.down_proj());
        assert_eq!(original.up_proj(), fused.up_proj());
    }
}
