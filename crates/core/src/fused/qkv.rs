use candle_core::{DType, Tensor};

use crate::error::{FuseError, Result};
use crate::layers::Linear;
use crate::weights::{WeightArena, WeightHandle};

/// One projection computing `concat(q(x), k(x), v(x))` on the last dimension.
#[derive(Debug, Clone)]
pub struct FusedQkv {
    proj: Linear,
    q_size: usize,
    kv_size: usize,
    sources: Vec<WeightHandle>,
}

/// Concatenate the q/k/v weights (and biases) into a new arena entry.
///
/// The source handles are recorded on the result so they can be released
/// once nothing refers to them anymore.
pub fn fuse_qkv(arena: &mut WeightArena, q: &Linear, k: &Linear, v: &Linear) -> Result<FusedQkv> {
    let (q_size, q_in) = q.dims(arena)?;
    let (k_size, k_in) = k.dims(arena)?;
    let (v_size, v_in) = v.dims(arena)?;
    if k_size != v_size || q_in != k_in || q_in != v_in {
        return Err(FuseError::ShapeMismatch {
            name: arena.name(k.weight())?.to_string(),
            expected: vec![v_size, v_in],
            got: vec![k_size, k_in],
        });
    }

    let weight = Tensor::cat(
        &[
            arena.get(q.weight())?,
            arena.get(k.weight())?,
            arena.get(v.weight())?,
        ],
        0,
    )?;
    let name = fused_name(arena.name(q.weight())?);
    let dtype = weight.dtype();
    let device = weight.device().clone();

    let mut sources = vec![q.weight(), k.weight(), v.weight()];
    let bias = if [q, k, v].iter().any(|l| l.bias().is_some()) {
        let mut parts = Vec::with_capacity(3);
        for (linear, size) in [(q, q_size), (k, k_size), (v, v_size)] {
            match linear.bias() {
                Some(b) => {
                    parts.push(arena.get(b)?.clone());
                    sources.push(b);
                }
                None => parts.push(Tensor::zeros(size, dtype, &device)?),
            }
        }
        let bias = Tensor::cat(&parts, 0)?;
        Some(arena.insert(format!("{name}.bias"), bias))
    } else {
        None
    };
    let weight = arena.insert(format!("{name}.weight"), weight);

    Ok(FusedQkv {
        proj: Linear::new(weight, bias),
        q_size,
        kv_size: k_size,
        sources,
    })
}

/// `...self_attn.q_proj.weight` -> `...self_attn.qkv_proj`.
fn fused_name(q_name: &str) -> String {
    let prefix = q_name
        .strip_suffix(".weight")
        .unwrap_or(q_name)
        .strip_suffix("q_proj")
        .unwrap_or("");
    format!("{prefix}qkv_proj")
}

impl FusedQkv {
    pub fn proj(&self) -> &Linear {
        &self.proj
    }

    pub fn q_size(&self) -> usize {
        self.q_size
    }

    pub fn kv_size(&self) -> usize {
        self.kv_size
    }

    /// Handles of the unfused q/k/v parameters this projection was built from.
    pub fn sources(&self) -> &[WeightHandle] {
        &self.sources
    }

    pub fn dtype(&self, arena: &WeightArena) -> Result<DType> {
        Ok(arena.get(self.proj.weight())?.dtype())
    }

    pub fn forward(&self, xs: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        self.proj.forward(xs, arena)
    }

    /// Split a fused output into `(q, k, v)` along the last dimension.
    pub fn split(&self, qkv: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let dim = qkv.rank() - 1;
        let q = qkv.narrow(dim, 0, self.q_size)?;
        let k = qkv.narrow(dim, self.q_size, self.kv_size)?;
        let v = qkv.narrow(dim, self.q_size + self.kv_size, self.kv_size)?;
        Ok((q, k, v))
    }
}
