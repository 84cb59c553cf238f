use std::path::Path;

use candle_nn::Activation;
use serde::Deserialize;

use crate::error::{FuseError, Result};

/// HuggingFace-style `config.json` of a decoder model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub head_dim: usize,
    pub hidden_act: String,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    /// Read and parse a `config.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Parse `hidden_act` into a candle activation.
    pub fn hidden_activation(&self) -> Result<Activation> {
        serde_json::from_value(serde_json::Value::String(self.hidden_act.clone())).map_err(|_| {
            FuseError::Unsupported(format!("hidden activation `{}`", self.hidden_act))
        })
    }

    fn extra_usize(&self, key: &str) -> Option<usize> {
        self.extra
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["MixtralForCausalLM".to_string()],
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            num_hidden_layers: 32,
            intermediate_size: 14336,
            vocab_size: 32000,
            max_position_embeddings: 32768,
            head_dim: 128,
            hidden_act: "silu".to_string(),
            rms_norm_eps: 1e-5,
            rope_theta: 1_000_000.0,
            tie_word_embeddings: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// Config key whose value bounds the fused model's sequence length
/// (`ModelConfig::max_position_embeddings`).
pub const MAX_NEW_TOKENS_KEY: &str = "max_position_embeddings";

/// Mixtral view of a [`ModelConfig`].
#[derive(Debug, Clone)]
pub struct MixtralConfig {
    pub base: ModelConfig,
    /// Number of experts in each sparse MoE block.
    pub num_local_experts: usize,
    /// Number of experts activated per token.
    pub num_experts_per_tok: usize,
    /// Maximum sequence length the fused blocks are built for.
    pub max_new_tokens: usize,
}

impl MixtralConfig {
    /// Extract MoE parameters from `extra`, defaulting to Mixtral 8x7B values.
    pub fn from_model_config(cfg: &ModelConfig) -> Self {
        let num_local_experts = cfg.extra_usize("num_local_experts").unwrap_or(8);
        let num_experts_per_tok = cfg.extra_usize("num_experts_per_tok").unwrap_or(2);
        Self {
            base: cfg.clone(),
            num_local_experts,
            num_experts_per_tok,
            max_new_tokens: cfg.max_position_embeddings,
        }
    }

    /// Override the fused sequence-length bound.
    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_new_tokens = max_seq_len;
        self
    }
}
