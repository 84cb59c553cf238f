use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;

use crate::error::Result;
use crate::weights::{WeightArena, WeightHandle};

/// Reference RMSNorm as it appears in the unfused decoder layers.
///
/// Computes variance, normalisation and weight scaling as separate tensor
/// ops in f32. [`FusedRmsNorm`] is its single-kernel replacement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsNorm {
    weight: WeightHandle,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: WeightHandle, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn load(arena: &mut WeightArena, size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = arena.load(&vb, size, "weight")?;
        Ok(Self::new(weight, eps))
    }

    pub fn weight(&self) -> WeightHandle {
        self.weight
    }

    /// Variance epsilon.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn forward(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let weight = arena.get(self.weight)?;
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(xs.to_dtype(dtype)?.broadcast_mul(weight)?)
    }
}

/// RMSNorm dispatched to candle's fused kernel.
///
/// Shares the weight handle of the norm it replaces; nothing is copied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedRmsNorm {
    weight: WeightHandle,
    eps: f64,
}

impl FusedRmsNorm {
    pub fn new(weight: WeightHandle, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn weight(&self) -> WeightHandle {
        self.weight
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn forward(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let weight = arena.get(self.weight)?;
        Ok(candle_nn::ops::rms_norm(
            &xs.contiguous()?,
            weight,
            self.eps as f32,
        )?)
    }
}

impl From<&RmsNorm> for FusedRmsNorm {
    fn from(norm: &RmsNorm) -> Self {
        Self::new(norm.weight(), norm.eps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn weight_arena(hidden: usize) -> (WeightArena, WeightHandle) {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..hidden).map(|i| 0.5 + 0.01 * i as f32).collect();
        let mut arena = WeightArena::new();
        let h = arena.insert("norm.weight", Tensor::from_vec(data, hidden, &device).unwrap());
        (arena, h)
    }

    fn input(rows: usize, hidden: usize) -> Tensor {
        let data: Vec<f32> = (0..rows * hidden)
            .map(|i| (i as f32 * 0.37).sin() * 2.0)
            .collect();
        Tensor::from_vec(data, (rows, hidden), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_rms_norm_unit_weight_is_normalized() {
        let device = Device::Cpu;
        let hidden = 32;
        let mut arena = WeightArena::new();
        let h = arena.insert("w", Tensor::ones(hidden, DType::F32, &device).unwrap());
        let norm = RmsNorm::new(h, 1e-6);

        let output = norm.forward(&input(2, hidden), &arena).unwrap();
        let output_data: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for row in output_data.chunks(hidden) {
            let rms: f32 = (row.iter().map(|x| x * x).sum::<f32>() / hidden as f32).sqrt();
            assert!((rms - 1.0).abs() < 1e-3, "RMS should be close to 1.0, got {rms}");
        }
    }

    #[test]
    fn test_fused_matches_reference() {
        let hidden = 64;
        let (arena, h) = weight_arena(hidden);
        let reference = RmsNorm::new(h, 1e-5);
        let fused = FusedRmsNorm::from(&reference);

        let xs = input(4, hidden);
        let a: Vec<f32> = reference
            .forward(&xs, &arena)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = fused
            .forward(&xs, &arena)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < 1e-5, "Mismatch at index {i}: ref={x}, fused={y}");
        }
    }

    #[test]
    fn test_fused_shares_weight_handle() {
        let (_arena, h) = weight_arena(8);
        let reference = RmsNorm::new(h, 1e-6);
        let fused = FusedRmsNorm::from(&reference);
        assert_eq!(fused.weight(), reference.weight());
        assert_eq!(fused.eps(), reference.eps());
    }

    #[test]
    fn test_fused_3d_input() {
        let hidden = 16;
        let (arena, h) = weight_arena(hidden);
        let fused = FusedRmsNorm::new(h, 1e-5);

        let xs = input(16, hidden).reshape((2, 8, hidden)).unwrap();
        let output = fused.forward(&xs, &arena).unwrap();
        assert_eq!(output.dims(), &[2, 8, hidden]);
    }
}
