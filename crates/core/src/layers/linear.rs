use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::error::Result;
use crate::weights::{WeightArena, WeightHandle};

/// Linear projection `y = x W^T (+ b)` whose parameters live in a [`WeightArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    weight: WeightHandle,
    bias: Option<WeightHandle>,
}

impl Linear {
    pub fn new(weight: WeightHandle, bias: Option<WeightHandle>) -> Self {
        Self { weight, bias }
    }

    /// Load `{prefix}.weight` of shape `[out_dim, in_dim]` (and `{prefix}.bias`).
    pub fn load(
        arena: &mut WeightArena,
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = arena.load(&vb, (out_dim, in_dim), "weight")?;
        let bias = if bias {
            Some(arena.load(&vb, out_dim, "bias")?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn load_no_bias(
        arena: &mut WeightArena,
        in_dim: usize,
        out_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::load(arena, in_dim, out_dim, false, vb)
    }

    pub fn weight(&self) -> WeightHandle {
        self.weight
    }

    pub fn bias(&self) -> Option<WeightHandle> {
        self.bias
    }

    /// `[out_features, in_features]` of the current weight.
    pub fn dims(&self, arena: &WeightArena) -> Result<(usize, usize)> {
        let w = arena.get(self.weight)?;
        Ok(w.dims2()?)
    }

    pub fn forward(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let weight = arena.get(self.weight)?.clone();
        let bias = match self.bias {
            Some(b) => Some(arena.get(b)?.clone()),
            None => None,
        };
        Ok(candle_nn::Linear::new(weight, bias).forward(xs)?)
    }
}

/// Token embedding table stored in a [`WeightArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Embedding {
    weight: WeightHandle,
    hidden_size: usize,
}

impl Embedding {
    pub fn new(weight: WeightHandle, hidden_size: usize) -> Self {
        Self {
            weight,
            hidden_size,
        }
    }

    pub fn load(
        arena: &mut WeightArena,
        vocab_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = arena.load(&vb, (vocab_size, hidden_size), "weight")?;
        Ok(Self::new(weight, hidden_size))
    }

    pub fn weight(&self) -> WeightHandle {
        self.weight
    }

    pub fn forward(&self, input_ids: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let table = arena.get(self.weight)?.clone();
        Ok(candle_nn::Embedding::new(table, self.hidden_size).forward(input_ids)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn linear_matches_manual_matmul() {
        let device = Device::Cpu;
        let mut arena = WeightArena::new();
        let w = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]], &device).unwrap();
        let b = Tensor::new(&[0.5f32, -0.5, 1.0], &device).unwrap();
        let linear = Linear::new(arena.insert("w", w), Some(arena.insert("b", b)));

        let x = Tensor::new(&[[1.0f32, 1.0]], &device).unwrap();
        let y: Vec<f32> = linear
            .forward(&x, &arena)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(y, vec![3.5, 6.5, 12.0]);
        assert_eq!(linear.dims(&arena).unwrap(), (3, 2));
    }

    #[test]
    fn linear_accepts_batched_input() {
        let device = Device::Cpu;
        let mut arena = WeightArena::new();
        let w = Tensor::ones((6, 4), DType::F32, &device).unwrap();
        let linear = Linear::new(arena.insert("w", w), None);

        let x = Tensor::ones((2, 3, 4), DType::F32, &device).unwrap();
        let y = linear.forward(&x, &arena).unwrap();
        assert_eq!(y.dims(), &[2, 3, 6]);
    }

    #[test]
    fn embedding_lookup() {
        let device = Device::Cpu;
        let mut arena = WeightArena::new();
        let table = Tensor::arange(0f32, 12.0, &device)
            .unwrap()
            .reshape((4, 3))
            .unwrap();
        let embed = Embedding::new(arena.insert("embed", table), 3);

        let ids = Tensor::new(&[[2u32, 0]], &device).unwrap();
        let out = embed.forward(&ids, &arena).unwrap();
        assert_eq!(out.dims(), &[1, 2, 3]);
        let rows: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(rows, vec![6.0, 7.0, 8.0, 0.0, 1.0, 2.0]);
    }
}
