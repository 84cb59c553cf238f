//! Tiny Mixtral fixtures for integration tests.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use mixfuse_core::{MixtralConfig, MixtralForCausalLM, ModelConfig};

pub const HIDDEN: usize = 8;
pub const EXPERTS: usize = 4;
pub const LAYERS: usize = 2;
pub const VOCAB: usize = 32;

// ─── Tiny Config Helpers ─────────────────────────────────────────────────────

/// 2 layers, 4 experts, hidden 8, head_dim 4, `num_kv_heads` KV heads.
pub fn tiny_config(num_kv_heads: usize, top_k: usize) -> MixtralConfig {
    let mut extra = serde_json::Map::new();
    extra.insert("num_local_experts".to_string(), EXPERTS.into());
    extra.insert("num_experts_per_tok".to_string(), top_k.into());
    let base = ModelConfig {
        architectures: vec!["MixtralForCausalLM".to_string()],
        hidden_size: HIDDEN,
        num_attention_heads: 2,
        num_key_value_heads: num_kv_heads,
        num_hidden_layers: LAYERS,
        intermediate_size: 16,
        vocab_size: VOCAB,
        max_position_embeddings: 128,
        head_dim: 4,
        hidden_act: "silu".to_string(),
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        tie_word_embeddings: false,
        extra,
    };
    MixtralConfig::from_model_config(&base)
}

// ─── Synthetic Weights ───────────────────────────────────────────────────────

fn wave(shape: (usize, usize), seed: u64, scale: f32) -> Tensor {
    let n = shape.0 * shape.1;
    let data: Vec<f32> = (0..n)
        .map(|i| scale * ((i as f32 + 1.0) * 0.754_877 + seed as f32 * 0.577_215).sin())
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
}

fn norm(size: usize, seed: u64) -> Tensor {
    let data: Vec<f32> = (0..size)
        .map(|i| 1.0 + 0.1 * ((i as f32 + 1.0) * 1.3 + seed as f32).cos())
        .collect();
    Tensor::from_vec(data, size, &Device::Cpu).unwrap()
}

pub fn tiny_model(cfg: &MixtralConfig) -> MixtralForCausalLM {
    let base = &cfg.base;
    let q_out = base.num_attention_heads * base.head_dim;
    let kv_out = base.num_key_value_heads * base.head_dim;
    let inter = base.intermediate_size;

    let mut ts: HashMap<String, Tensor> = HashMap::new();
    ts.insert("model.embed_tokens.weight".into(), wave((VOCAB, HIDDEN), 1, 1.0));
    for l in 0..base.num_hidden_layers {
        let p = format!("model.layers.{l}");
        let s = 50 * (l as u64 + 1);
        ts.insert(format!("{p}.self_attn.q_proj.weight"), wave((q_out, HIDDEN), s, 0.4));
        ts.insert(format!("{p}.self_attn.k_proj.weight"), wave((kv_out, HIDDEN), s + 1, 0.4));
        ts.insert(format!("{p}.self_attn.v_proj.weight"), wave((kv_out, HIDDEN), s + 2, 0.4));
        ts.insert(format!("{p}.self_attn.o_proj.weight"), wave((HIDDEN, q_out), s + 3, 0.4));
        ts.insert(format!("{p}.input_layernorm.weight"), norm(HIDDEN, s + 4));
        ts.insert(format!("{p}.post_attention_layernorm.weight"), norm(HIDDEN, s + 5));
        ts.insert(
            format!("{p}.block_sparse_moe.gate.weight"),
            wave((EXPERTS, HIDDEN), s + 6, 1.0),
        );
        for e in 0..EXPERTS {
            let ep = format!("{p}.block_sparse_moe.experts.{e}");
            let es = s + 10 + 3 * e as u64;
            ts.insert(format!("{ep}.w1.weight"), wave((inter, HIDDEN), es, 0.4));
            ts.insert(format!("{ep}.w2.weight"), wave((HIDDEN, inter), es + 1, 0.4));
            ts.insert(format!("{ep}.w3.weight"), wave((inter, HIDDEN), es + 2, 0.4));
        }
    }
    ts.insert("model.norm.weight".into(), norm(HIDDEN, 7));
    ts.insert("lm_head.weight".into(), wave((VOCAB, HIDDEN), 9, 0.5));

    let vb = VarBuilder::from_tensors(ts, DType::F32, &Device::Cpu);
    MixtralForCausalLM::new(cfg, vb).unwrap()
}

pub fn input_ids() -> Tensor {
    Tensor::new(&[[4u32, 17, 9, 30, 2, 11, 6]], &Device::Cpu).unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
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
