//! Conversion of decoder layers into fused blocks.

use candle_nn::Activation;
use tracing::{debug, info};

use super::block::FusedBlock;
use super::model::FusedModel;
use super::qkv::fuse_qkv;
use crate::config::MixtralConfig;
use crate::error::{FuseError, Result};
use crate::layers::{FusedRmsNorm, RotaryEmbedding};
use crate::models::{MixtralForCausalLM, ModelBody, MoeDecoderLayer};
use crate::moe::{Expert, FusedExpert};
use crate::weights::WeightArena;

/// Fail unless every unfused expert of `layer` uses SiLU.
pub fn check_fusable<L: MoeDecoderLayer>(layer: &L) -> Result<()> {
    for (i, expert) in layer.moe().experts().iter().enumerate() {
        if let Expert::Mlp(mlp) = expert {
            if !matches!(mlp.act(), Activation::Silu) {
                return Err(FuseError::Unsupported(format!(
                    "expert {i} uses {:?}, fused experts require silu",
                    mlp.act()
                )));
            }
        }
    }
    Ok(())
}

/// Build the fused block of one layer.
///
/// Experts are replaced in place in the layer's MoE block, which the block
/// then takes over. The only new parameter is the concatenated QKV weight.
pub fn fuse_layer<L: MoeDecoderLayer>(
    mut layer: L,
    arena: &mut WeightArena,
    cfg: &MixtralConfig,
) -> Result<FusedBlock> {
    check_fusable(&layer)?;
    let device = layer.device(arena)?;

    let qkv = fuse_qkv(arena, layer.q_proj(), layer.k_proj(), layer.v_proj())?;
    let dtype = qkv.dtype(arena)?;

    for expert in layer.moe_mut().experts_mut() {
        let fused = FusedExpert::new(*expert.gate_proj(), *expert.down_proj(), *expert.up_proj());
        *expert = Expert::Fused(fused);
    }

    let norm_1 = FusedRmsNorm::from(layer.input_layernorm());
    let norm_2 = FusedRmsNorm::from(layer.post_attention_layernorm());
    let rotary_emb = RotaryEmbedding::new(
        layer.head_dim(),
        cfg.max_new_tokens,
        cfg.base.rope_theta,
        dtype,
        &device,
    )?;

    let num_heads = layer.num_heads();
    let num_kv_heads = layer.num_kv_heads();
    let o_proj = *layer.o_proj();

    Ok(FusedBlock::new(
        cfg.base.hidden_size,
        num_heads,
        num_kv_heads,
        qkv,
        o_proj,
        layer.into_moe(),
        norm_1,
        norm_2,
        device,
        cfg.max_new_tokens,
        rotary_emb,
    ))
}

/// Replace the decoder body of `model` with a [`FusedModel`].
///
/// Fails with [`FuseError::StructuralMismatch`] when the body is already
/// fused. A failure after the first layer leaves the model unusable.
pub fn fuse_layers(model: &mut MixtralForCausalLM) -> Result<()> {
    let (cfg, arena, body) = model.parts_mut();
    let decoder = match &mut *body {
        ModelBody::Decoder(decoder) => decoder,
        ModelBody::Fused(_) => {
            return Err(FuseError::StructuralMismatch(
                "model layers are already fused".to_string(),
            ))
        }
    };
    for layer in decoder.layers() {
        check_fusable(layer)?;
    }

    let live_before = arena.live_bytes();
    info!(
        layers = decoder.layers().len(),
        max_seq_len = cfg.max_new_tokens,
        "fusing decoder layers"
    );

    let layers = std::mem::take(&mut decoder.layers);
    let mut blocks = Vec::with_capacity(layers.len());
    for (idx, layer) in layers.into_iter().enumerate() {
        let block = fuse_layer(layer, arena, cfg)?;
        debug!(
            layer = idx,
            experts = block.moe().num_experts(),
            qkv = block.qkv().q_size() + 2 * block.qkv().kv_size(),
            "fused layer"
        );
        blocks.push(block);
    }

    let released: Vec<_> = blocks
        .iter()
        .flat_map(|b| b.qkv().sources().iter().copied())
        .collect();
    let fused = FusedModel::new(cfg.base.vocab_size, blocks, decoder.embed_tokens, decoder.norm);
    *body = ModelBody::Fused(fused);

    for handle in released {
        arena.release(handle)?;
    }

    info!(
        live_bytes_before = live_before,
        live_bytes_after = arena.live_bytes(),
        "fusion complete"
    );
    Ok(())
}
