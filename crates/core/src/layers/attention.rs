use candle_core::{DType, Device, Tensor};

use crate::error::{FuseError, Result};

/// Per-call inputs of a decoder layer that are not activations.
///
/// These are the keyword arguments a calibration pass replays when it
/// inspects a whole attention block.
#[derive(Debug, Clone, Default)]
pub struct LayerKwargs {
    /// Position of the first token of the input.
    pub seqlen_offset: usize,
    /// Additive mask broadcastable to `[b, heads, q_len, kv_len]`.
    pub attention_mask: Option<Tensor>,
}

impl LayerKwargs {
    /// Kwargs for a causal prefill of `seq_len` tokens starting at position 0.
    pub fn causal(seq_len: usize, dtype: DType, device: &Device) -> Result<Self> {
        let attention_mask = if seq_len <= 1 {
            None
        } else {
            Some(causal_mask(seq_len, 0, dtype, device)?)
        };
        Ok(Self {
            seqlen_offset: 0,
            attention_mask,
        })
    }
}

/// Causal attention mask of shape `[1, 1, seq_len, seq_len + seqlen_offset]`.
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?;
    Ok(mask.to_dtype(dtype)?)
}

/// Repeat KV heads for Grouped Query Attention.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    Ok(x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))?)
}

/// Scaled dot-product GQA attention.
///
/// `q` is `[b, num_heads, q_len, head_dim]`, `k`/`v` are
/// `[b, num_kv_heads, kv_len, head_dim]`. Returns `[b, q_len, num_heads * head_dim]`.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attention_mask: Option<&Tensor>,
    num_heads: usize,
    num_kv_heads: usize,
) -> Result<Tensor> {
    let (b_sz, _, q_len, head_dim) = q.dims4()?;
    let num_kv_groups = num_heads / num_kv_heads;
    let k = repeat_kv(k.clone(), num_kv_groups)?.contiguous()?;
    let v = repeat_kv(v.clone(), num_kv_groups)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
    let attn_weights = match attention_mask {
        Some(mask) => attn_weights.broadcast_add(mask)?,
        None => attn_weights,
    };
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(&v)?;

    Ok(attn_output
        .transpose(1, 2)?
        .reshape((b_sz, q_len, num_heads * head_dim))?)
}

/// Contiguous key/value cache for one attention block, bounded by `max_seq_len`.
#[derive(Debug, Clone)]
pub struct KvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
    max_seq_len: usize,
}

impl KvCache {
    pub fn new(max_seq_len: usize) -> Self {
        Self {
            k: None,
            v: None,
            max_seq_len,
        }
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.k
            .as_ref()
            .and_then(|k| k.dims().get(2).copied())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Append `[b, kv_heads, seq, head_dim]` keys/values and return the full history.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let requested = self.len() + k.dim(2)?;
        if requested > self.max_seq_len {
            return Err(FuseError::SequenceTooLong {
                requested,
                max: self.max_seq_len,
            });
        }
        let (k, v) = match (&self.k, &self.v) {
            (Some(prev_k), Some(prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?.contiguous()?,
                Tensor::cat(&[prev_v, v], 2)?.contiguous()?,
            ),
            _ => (k.contiguous()?, v.contiguous()?),
        };
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}
