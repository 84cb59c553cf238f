use candle_core::{Device, Tensor};

use super::qkv::FusedQkv;
use crate::error::Result;
use crate::layers::{scaled_dot_product_attention, FusedRmsNorm, KvCache, Linear, RotaryEmbedding};
use crate::moe::SparseMoeBlock;
use crate::weights::WeightArena;

/// Fused replacement of one decoder layer.
///
/// Computes the same function as the layer it was built from, with a single
/// QKV projection and a KV cache holding up to `max_seq_len` positions.
#[derive(Debug, Clone)]
pub struct FusedBlock {
    hidden_size: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    qkv: FusedQkv,
    o_proj: Linear,
    moe: SparseMoeBlock,
    norm_1: FusedRmsNorm,
    norm_2: FusedRmsNorm,
    device: Device,
    max_seq_len: usize,
    rotary_emb: RotaryEmbedding,
    kv_cache: KvCache,
}

impl FusedBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        qkv: FusedQkv,
        o_proj: Linear,
        moe: SparseMoeBlock,
        norm_1: FusedRmsNorm,
        norm_2: FusedRmsNorm,
        device: Device,
        max_seq_len: usize,
        rotary_emb: RotaryEmbedding,
    ) -> Self {
        Self {
            hidden_size,
            num_heads,
            num_kv_heads,
            head_dim: qkv.q_size() / num_heads,
            qkv,
            o_proj,
            moe,
            norm_1,
            norm_2,
            device,
            max_seq_len,
            rotary_emb,
            kv_cache: KvCache::new(max_seq_len),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn qkv(&self) -> &FusedQkv {
        &self.qkv
    }

    pub fn o_proj(&self) -> &Linear {
        &self.o_proj
    }

    pub fn moe(&self) -> &SparseMoeBlock {
        &self.moe
    }

    pub fn norm_1(&self) -> &FusedRmsNorm {
        &self.norm_1
    }

    pub fn norm_2(&self) -> &FusedRmsNorm {
        &self.norm_2
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Positions currently held in the KV cache.
    pub fn cache_len(&self) -> usize {
        self.kv_cache.len()
    }

    pub fn reset_cache(&mut self) {
        self.kv_cache.reset();
    }

    /// `xs` is `[b, seq, hidden]`; positions continue from the cache.
    pub fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = xs.dims3()?;
        let seqlen_offset = self.kv_cache.len();

        let h = self.norm_1.forward(xs, arena)?;
        let qkv = self.qkv.forward(&h, arena)?;
        let (q, k, v) = self.qkv.split(&qkv)?;

        let q = q
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = self.rotary_emb.apply(&q, &k, seqlen_offset)?;
        let (k, v) = self.kv_cache.append(&k, &v)?;

        let attn = scaled_dot_product_attention(
            &q,
            &k,
            &v,
            attention_mask,
            self.num_heads,
            self.num_kv_heads,
        )?;
        let h = (xs + self.o_proj.forward(&attn, arena)?)?;

        let out = self.moe.forward(&self.norm_2.forward(&h, arena)?, arena)?;
        Ok((h + out)?)
    }
}
