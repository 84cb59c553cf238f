use std::collections::HashMap;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::VarBuilder;

use crate::config::MixtralConfig;

/// Smooth pseudo-random values in `[-scale, scale]`, fully determined by
/// `seed` and the shape.
pub fn deterministic_tensor<S: Into<Shape>>(shape: S, seed: u64, scale: f32, device: &Device) -> Tensor {
    let shape = shape.into();
    let phase = seed as f32 * 1.414_213_5;
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|i| scale * ((i as f32 + 1.0) * 0.618_034 + phase).sin())
        .collect();
    Tensor::from_vec(data, shape, device).expect("deterministic tensor")
}

fn norm_weight(size: usize, seed: u64, device: &Device) -> Tensor {
    (deterministic_tensor(size, seed, 0.1, device) + 1.0).expect("norm weight")
}

/// HuggingFace-named Mixtral weights for `cfg`.
pub fn tiny_var_builder(cfg: &MixtralConfig, device: &Device) -> VarBuilder<'static> {
    let base = &cfg.base;
    let hidden = base.hidden_size;
    let q_out = base.num_attention_heads * base.head_dim;
    let kv_out = base.num_key_value_heads * base.head_dim;
    let inter = base.intermediate_size;

    let mut ts = HashMap::new();
    let mut add = |name: String, t: Tensor| {
        ts.insert(name, t);
    };

    add(
        "model.embed_tokens.weight".to_string(),
        deterministic_tensor((base.vocab_size, hidden), 1, 1.0, device),
    );
    for l in 0..base.num_hidden_layers {
        let p = format!("model.layers.{l}");
        let seed = 100 * (l as u64 + 1);
        add(format!("{p}.self_attn.q_proj.weight"), deterministic_tensor((q_out, hidden), seed, 0.3, device));
        add(format!("{p}.self_attn.k_proj.weight"), deterministic_tensor((kv_out, hidden), seed + 1, 0.3, device));
        add(format!("{p}.self_attn.v_proj.weight"), deterministic_tensor((kv_out, hidden), seed + 2, 0.3, device));
        add(format!("{p}.self_attn.o_proj.weight"), deterministic_tensor((hidden, q_out), seed + 3, 0.3, device));
        add(format!("{p}.input_layernorm.weight"), norm_weight(hidden, seed + 4, device));
        add(format!("{p}.post_attention_layernorm.weight"), norm_weight(hidden, seed + 5, device));
        add(
            format!("{p}.block_sparse_moe.gate.weight"),
            deterministic_tensor((cfg.num_local_experts, hidden), seed + 6, 1.0, device),
        );
        for e in 0..cfg.num_local_experts {
            let ep = format!("{p}.block_sparse_moe.experts.{e}");
            let es = seed + 10 + 3 * e as u64;
            add(format!("{ep}.w1.weight"), deterministic_tensor((inter, hidden), es, 0.3, device));
            add(format!("{ep}.w2.weight"), deterministic_tensor((hidden, inter), es + 1, 0.3, device));
            add(format!("{ep}.w3.weight"), deterministic_tensor((inter, hidden), es + 2, 0.3, device));
        }
    }
    add("model.norm.weight".to_string(), norm_weight(hidden, 2, device));
    if !base.tie_word_embeddings {
        add(
            "lm_head.weight".to_string(),
            deterministic_tensor((base.vocab_size, hidden), 3, 0.5, device),
        );
    }

    VarBuilder::from_tensors(ts, DType::F32, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_tensor_is_reproducible() {
        let device = Device::Cpu;
        let a = deterministic_tensor((3, 4), 7, 0.5, &device);
        let b = deterministic_tensor((3, 4), 7, 0.5, &device);
        let c = deterministic_tensor((3, 4), 8, 0.5, &device);
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
        assert_ne!(a.to_vec2::<f32>().unwrap(), c.to_vec2::<f32>().unwrap());

        let max: f32 = a.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap();
        assert!(max <= 0.5);
    }
}
