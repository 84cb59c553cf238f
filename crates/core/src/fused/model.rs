use candle_core::Tensor;

use super::block::FusedBlock;
use crate::error::Result;
use crate::layers::{causal_mask, Embedding, RmsNorm};
use crate::weights::WeightArena;

/// Fused model body: the unfused embedding and final norm around fused blocks.
#[derive(Debug, Clone)]
pub struct FusedModel {
    vocab_size: usize,
    blocks: Vec<FusedBlock>,
    embedding: Embedding,
    norm: RmsNorm,
}

impl FusedModel {
    pub fn new(vocab_size: usize, blocks: Vec<FusedBlock>, embedding: Embedding, norm: RmsNorm) -> Self {
        Self {
            vocab_size,
            blocks,
            embedding,
            norm,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn blocks(&self) -> &[FusedBlock] {
        &self.blocks
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn norm(&self) -> &RmsNorm {
        &self.norm
    }

    /// Positions already processed since the last reset.
    pub fn seqlen_offset(&self) -> usize {
        self.blocks.first().map_or(0, FusedBlock::cache_len)
    }

    pub fn reset_cache(&mut self) {
        for block in &mut self.blocks {
            block.reset_cache();
        }
    }

    /// Hidden states `[b, seq, hidden]` for `input_ids` (`[b, seq]`), continuing
    /// after the cached positions.
    pub fn forward(&mut self, input_ids: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let seqlen_offset = self.seqlen_offset();

        let mut h = self.embedding.forward(input_ids, arena)?;
        let mask = if seq_len <= 1 {
            None
        } else {
            Some(causal_mask(seq_len, seqlen_offset, h.dtype(), h.device())?)
        };

        for block in &mut self.blocks {
            h = block.forward(&h, mask.as_ref(), arena)?;
        }
        self.norm.forward(&h, arena)
    }
}
