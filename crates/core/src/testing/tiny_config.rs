use crate::config::{MixtralConfig, ModelConfig};

fn tiny_base(num_kv_heads: usize, num_experts_per_tok: usize) -> ModelConfig {
    let mut extra = serde_json::Map::new();
    extra.insert("num_local_experts".to_string(), 4.into());
    extra.insert("num_experts_per_tok".to_string(), num_experts_per_tok.into());
    ModelConfig {
        architectures: vec!["MixtralForCausalLM".to_string()],
        hidden_size: 8,
        num_attention_heads: 2,
        num_key_value_heads: num_kv_heads,
        num_hidden_layers: 2,
        intermediate_size: 12,
        vocab_size: 32,
        max_position_embeddings: 64,
        head_dim: 4,
        hidden_act: "silu".to_string(),
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        tie_word_embeddings: false,
        extra,
    }
}

/// 2 layers, hidden 8, 2 heads (MHA), 4 experts.
///
/// Every token is routed to all 4 experts, so a capturing forward pass
/// records inputs for each of them.
pub fn tiny_mixtral_config() -> MixtralConfig {
    MixtralConfig::from_model_config(&tiny_base(2, 4))
}

/// Same as [`tiny_mixtral_config`] with Mixtral's top-2 routing.
pub fn tiny_top2_mixtral_config() -> MixtralConfig {
    MixtralConfig::from_model_config(&tiny_base(2, 2))
}

/// GQA variant (1 KV head): `v_proj` and `o_proj` shapes differ.
pub fn tiny_gqa_mixtral_config() -> MixtralConfig {
    MixtralConfig::from_model_config(&tiny_base(1, 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_mixtral_config_is_valid() {
        let config = tiny_mixtral_config();
        assert_eq!(config.base.hidden_size, 8);
        assert_eq!(config.base.num_hidden_layers, 2);
        assert_eq!(config.num_local_experts, 4);
        assert_eq!(config.num_experts_per_tok, 4);
        assert_eq!(config.max_new_tokens, 64);
        assert_eq!(
            config.base.num_attention_heads * config.base.head_dim,
            config.base.hidden_size
        );
    }

    #[test]
    fn variants_differ_where_expected() {
        assert_eq!(tiny_top2_mixtral_config().num_experts_per_tok, 2);
        // GQA ratio 2
        let gqa = tiny_gqa_mixtral_config();
        assert_eq!(gqa.base.num_attention_heads / gqa.base.num_key_value_heads, 2);
    }
}
