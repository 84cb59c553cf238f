//! Mixtral sparse mixture-of-experts decoder.
//!
//! Mixtral is a Mistral-style decoder whose feed-forward is a sparse MoE
//! block (8 experts, top-2 routing for 8x7B). Parameters live in the model's
//! [`WeightArena`]; layers and operators hold handles into it.
//!
//! The model body starts out as a [`MixtralModel`] of decoder layers and can
//! be fused exactly once into a [`FusedModel`] (see [`crate::fused`]).

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use super::MoeDecoderLayer;
use crate::config::{MixtralConfig, ModelConfig, MAX_NEW_TOKENS_KEY};
use crate::error::{FuseError, Result};
use crate::fused::{fuse_layers, FusedModel};
use crate::layers::{
    scaled_dot_product_attention, Embedding, LayerKwargs, Linear, RmsNorm, RotaryEmbedding,
};
use crate::moe::SparseMoeBlock;
use crate::quantization::capture::{InputFeatures, O_PROJ_KEY, Q_PROJ_KEY};
use crate::quantization::{discover_scale_groups, ActScaling, AwqModel, ScaleGroup};
use crate::weights::WeightArena;

// ─── Attention ───────────────────────────────────────────────────────────────

/// GQA self-attention with rotary embeddings, no KV cache.
#[derive(Debug, Clone)]
pub struct MixtralAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl MixtralAttention {
    pub fn load(arena: &mut WeightArena, cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_key_value_heads;
        let head_dim = cfg.head_dim;

        let q_proj = Linear::load_no_bias(arena, cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = Linear::load_no_bias(arena, cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = Linear::load_no_bias(arena, cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = Linear::load_no_bias(arena, num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?;

        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    pub fn q_proj(&self) -> &Linear {
        &self.q_proj
    }

    pub fn k_proj(&self) -> &Linear {
        &self.k_proj
    }

    pub fn v_proj(&self) -> &Linear {
        &self.v_proj
    }

    pub fn o_proj(&self) -> &Linear {
        &self.o_proj
    }

    pub fn forward(&self, xs: &Tensor, kwargs: &LayerKwargs, arena: &WeightArena) -> Result<Tensor> {
        self.forward_impl(xs, kwargs, arena, None)
    }

    /// Forward pass recording the inputs of `q_proj` and `o_proj`.
    pub fn forward_with_capture(
        &self,
        xs: &Tensor,
        kwargs: &LayerKwargs,
        arena: &WeightArena,
        input_feat: &mut InputFeatures,
    ) -> Result<Tensor> {
        self.forward_impl(xs, kwargs, arena, Some(input_feat))
    }

    fn forward_impl(
        &self,
        xs: &Tensor,
        kwargs: &LayerKwargs,
        arena: &WeightArena,
        mut capture: Option<&mut InputFeatures>,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = xs.dims3()?;
        if let Some(input_feat) = capture.as_deref_mut() {
            input_feat.record(Q_PROJ_KEY, xs)?;
        }

        let q = self.q_proj.forward(xs, arena)?;
        let k = self.k_proj.forward(xs, arena)?;
        let v = self.v_proj.forward(xs, arena)?;

        let q = q
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = self.rotary_emb.apply(&q, &k, kwargs.seqlen_offset)?;
        let attn_output = scaled_dot_product_attention(
            &q,
            &k,
            &v,
            kwargs.attention_mask.as_ref(),
            self.num_heads,
            self.num_kv_heads,
        )?;

        if let Some(input_feat) = capture {
            input_feat.record(O_PROJ_KEY, &attn_output)?;
        }
        self.o_proj.forward(&attn_output, arena)
    }
}

// ─── Decoder Layer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MixtralDecoderLayer {
    self_attn: MixtralAttention,
    block_sparse_moe: SparseMoeBlock,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl MixtralDecoderLayer {
    pub fn load(arena: &mut WeightArena, cfg: &MixtralConfig, vb: VarBuilder) -> Result<Self> {
        let base = &cfg.base;
        let act = base.hidden_activation()?;
        let self_attn = MixtralAttention::load(arena, base, vb.pp("self_attn"))?;
        let block_sparse_moe = SparseMoeBlock::load(arena, cfg, act, vb.pp("block_sparse_moe"))?;
        let input_layernorm =
            RmsNorm::load(arena, base.hidden_size, base.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = RmsNorm::load(
            arena,
            base.hidden_size,
            base.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            block_sparse_moe,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    pub fn self_attn(&self) -> &MixtralAttention {
        &self.self_attn
    }

    pub fn forward(&self, xs: &Tensor, kwargs: &LayerKwargs, arena: &WeightArena) -> Result<Tensor> {
        self.forward_impl(xs, kwargs, arena, None)
    }

    /// Forward pass that records every input the scale-group discovery reads.
    pub fn forward_with_capture(
        &self,
        xs: &Tensor,
        kwargs: &LayerKwargs,
        arena: &WeightArena,
        input_feat: &mut InputFeatures,
    ) -> Result<Tensor> {
        self.forward_impl(xs, kwargs, arena, Some(input_feat))
    }

    fn forward_impl(
        &self,
        xs: &Tensor,
        kwargs: &LayerKwargs,
        arena: &WeightArena,
        mut capture: Option<&mut InputFeatures>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs, arena)?;
        let xs = match capture.as_deref_mut() {
            Some(input_feat) => self
                .self_attn
                .forward_with_capture(&xs, kwargs, arena, input_feat)?,
            None => self.self_attn.forward(&xs, kwargs, arena)?,
        };
        let xs = (xs + residual)?;

        let residual = &xs;
        let hidden = self.post_attention_layernorm.forward(&xs, arena)?;
        let hidden = match capture {
            Some(input_feat) => self
                .block_sparse_moe
                .forward_with_capture(&hidden, arena, input_feat)?,
            None => self.block_sparse_moe.forward(&hidden, arena)?,
        };
        Ok((residual + hidden)?)
    }
}

impl MoeDecoderLayer for MixtralDecoderLayer {
    fn q_proj(&self) -> &Linear {
        self.self_attn.q_proj()
    }

    fn k_proj(&self) -> &Linear {
        self.self_attn.k_proj()
    }

    fn v_proj(&self) -> &Linear {
        self.self_attn.v_proj()
    }

    fn o_proj(&self) -> &Linear {
        self.self_attn.o_proj()
    }

    fn input_layernorm(&self) -> &RmsNorm {
        &self.input_layernorm
    }

    fn post_attention_layernorm(&self) -> &RmsNorm {
        &self.post_attention_layernorm
    }

    fn moe(&self) -> &SparseMoeBlock {
        &self.block_sparse_moe
    }

    fn moe_mut(&mut self) -> &mut SparseMoeBlock {
        &mut self.block_sparse_moe
    }

    fn into_moe(self) -> SparseMoeBlock {
        self.block_sparse_moe
    }

    fn num_heads(&self) -> usize {
        self.self_attn.num_heads
    }

    fn num_kv_heads(&self) -> usize {
        self.self_attn.num_kv_heads
    }

    fn head_dim(&self) -> usize {
        self.self_attn.head_dim
    }

    fn attention_forward(
        &self,
        xs: &Tensor,
        kwargs: &LayerKwargs,
        arena: &WeightArena,
    ) -> Result<Tensor> {
        self.self_attn.forward(xs, kwargs, arena)
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

/// Unfused model body: embedding, decoder layers, final norm.
#[derive(Debug, Clone)]
pub struct MixtralModel {
    pub(crate) embed_tokens: Embedding,
    pub(crate) layers: Vec<MixtralDecoderLayer>,
    pub(crate) norm: RmsNorm,
}

impl MixtralModel {
    pub fn load(arena: &mut WeightArena, cfg: &MixtralConfig, vb: VarBuilder) -> Result<Self> {
        let base = &cfg.base;
        let embed_tokens =
            Embedding::load(arena, base.vocab_size, base.hidden_size, vb.pp("embed_tokens"))?;

        let vb_l = vb.pp("layers");
        let mut layers = Vec::with_capacity(base.num_hidden_layers);
        for i in 0..base.num_hidden_layers {
            layers.push(MixtralDecoderLayer::load(arena, cfg, vb_l.pp(i))?);
        }

        let norm = RmsNorm::load(arena, base.hidden_size, base.rms_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
        })
    }

    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }

    pub fn layers(&self) -> &[MixtralDecoderLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [MixtralDecoderLayer] {
        &mut self.layers
    }

    pub fn norm(&self) -> &RmsNorm {
        &self.norm
    }

    /// Full causal prefill from position 0.
    pub fn forward(&self, input_ids: &Tensor, arena: &WeightArena) -> Result<Tensor> {
        let mut xs = self.embed_tokens.forward(input_ids, arena)?;
        let kwargs = LayerKwargs::causal(xs.dim(1)?, xs.dtype(), xs.device())?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &kwargs, arena)?;
        }
        self.norm.forward(&xs, arena)
    }
}

/// The replaceable body of a [`MixtralForCausalLM`].
#[derive(Debug)]
pub enum ModelBody {
    Decoder(MixtralModel),
    Fused(FusedModel),
}

impl ModelBody {
    pub fn is_fused(&self) -> bool {
        matches!(self, Self::Fused(_))
    }

    fn embed_tokens(&self) -> &Embedding {
        match self {
            Self::Decoder(model) => model.embed_tokens(),
            Self::Fused(model) => model.embedding(),
        }
    }
}

// ─── Causal LM ───────────────────────────────────────────────────────────────

/// Mixtral with its language-model head.
#[derive(Debug)]
pub struct MixtralForCausalLM {
    config: MixtralConfig,
    arena: WeightArena,
    body: ModelBody,
    lm_head: Linear,
}

impl MixtralForCausalLM {
    /// Load from HuggingFace-named tensors (`model.layers.{i}....`, `lm_head`).
    pub fn new(cfg: &MixtralConfig, vb: VarBuilder) -> Result<Self> {
        let mut arena = WeightArena::new();
        let model = MixtralModel::load(&mut arena, cfg, vb.pp("model"))?;

        let lm_head = if cfg.base.tie_word_embeddings {
            Linear::new(model.embed_tokens().weight(), None)
        } else {
            Linear::load_no_bias(&mut arena, cfg.base.hidden_size, cfg.base.vocab_size, vb.pp("lm_head"))?
        };

        debug!(
            layers = model.layers().len(),
            experts = cfg.num_local_experts,
            weights = arena.len(),
            "loaded Mixtral"
        );

        Ok(Self {
            config: cfg.clone(),
            arena,
            body: ModelBody::Decoder(model),
            lm_head,
        })
    }

    pub fn config(&self) -> &MixtralConfig {
        &self.config
    }

    pub fn arena(&self) -> &WeightArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut WeightArena {
        &mut self.arena
    }

    pub fn body(&self) -> &ModelBody {
        &self.body
    }

    pub fn lm_head(&self) -> &Linear {
        &self.lm_head
    }

    /// The unfused decoder layers.
    pub fn decoder_layers(&self) -> Result<&[MixtralDecoderLayer]> {
        match &self.body {
            ModelBody::Decoder(model) => Ok(model.layers()),
            ModelBody::Fused(_) => Err(FuseError::StructuralMismatch(
                "model body is already fused".to_string(),
            )),
        }
    }

    /// Mutable unfused decoder layers.
    pub fn decoder_layers_mut(&mut self) -> Result<&mut [MixtralDecoderLayer]> {
        match &mut self.body {
            ModelBody::Decoder(model) => Ok(model.layers_mut()),
            ModelBody::Fused(_) => Err(FuseError::StructuralMismatch(
                "model body is already fused".to_string(),
            )),
        }
    }

    pub fn fused_model(&self) -> Option<&FusedModel> {
        match &self.body {
            ModelBody::Fused(model) => Some(model),
            ModelBody::Decoder(_) => None,
        }
    }

    pub(crate) fn parts_mut(&mut self) -> (&MixtralConfig, &mut WeightArena, &mut ModelBody) {
        (&self.config, &mut self.arena, &mut self.body)
    }

    /// Logits `[b, seq, vocab]` for `input_ids` (`[b, seq]`, u32).
    ///
    /// The unfused body always prefills from position 0. The fused body
    /// continues from its KV cache.
    pub fn forward(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden = match &mut self.body {
            ModelBody::Decoder(model) => model.forward(input_ids, &self.arena)?,
            ModelBody::Fused(model) => model.forward(input_ids, &self.arena)?,
        };
        self.lm_head.forward(&hidden, &self.arena)
    }

    /// Clear the fused KV caches; a no-op on the unfused body.
    pub fn reset_cache(&mut self) {
        if let ModelBody::Fused(model) = &mut self.body {
            model.reset_cache();
        }
    }

    /// Run `input_ids` through the unfused stack and discover the scale
    /// groups of every layer, feeding each layer's output to the next.
    pub fn calibration_groups(&self, input_ids: &Tensor) -> Result<Vec<Vec<ScaleGroup>>> {
        let layers = self.decoder_layers()?;
        let mut xs = self.body.embed_tokens().forward(input_ids, &self.arena)?;
        let kwargs = LayerKwargs::causal(xs.dim(1)?, xs.dtype(), xs.device())?;

        let mut groups = Vec::with_capacity(layers.len());
        for (idx, layer) in layers.iter().enumerate() {
            let mut input_feat = InputFeatures::new();
            let out = layer.forward_with_capture(&xs, &kwargs, &self.arena, &mut input_feat)?;
            let layer_groups = self.layers_for_scaling(layer, &input_feat, &kwargs)?;
            debug!(layer = idx, groups = layer_groups.len(), "calibrated layer");
            groups.push(layer_groups);
            xs = out;
        }
        Ok(groups)
    }
}

impl AwqModel for MixtralForCausalLM {
    type Layer = MixtralDecoderLayer;

    const LAYER_TYPE: &'static str = "MixtralDecoderLayer";
    const MAX_NEW_TOKENS_KEY: &'static str = MAX_NEW_TOKENS_KEY;

    fn arena(&self) -> &WeightArena {
        &self.arena
    }

    fn model_layers(&self) -> Result<&[MixtralDecoderLayer]> {
        self.decoder_layers()
    }

    fn act_for_scaling(&self, _layer: &MixtralDecoderLayer) -> ActScaling {
        ActScaling::not_scalable()
    }

    fn move_embed(&mut self, device: &Device) -> Result<()> {
        let handle = self.body.embed_tokens().weight();
        let moved = self.arena.get(handle)?.to_device(device)?;
        self.arena.replace(handle, moved)?;
        Ok(())
    }

    fn layers_for_scaling(
        &self,
        layer: &MixtralDecoderLayer,
        input_feat: &InputFeatures,
        module_kwargs: &LayerKwargs,
    ) -> Result<Vec<ScaleGroup>> {
        discover_scale_groups(layer, &self.arena, input_feat, module_kwargs)
    }

    fn fuse_layers(&mut self) -> Result<()> {
        fuse_layers(self)
    }
}
