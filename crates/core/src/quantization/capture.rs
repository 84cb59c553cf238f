//! Captured operator inputs used to calibrate scale groups.
//!
//! Keys are operator paths relative to a decoder layer, e.g.
//! `self_attn.q_proj` or `block_sparse_moe.experts.3.w1`.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{FuseError, Result};

pub const Q_PROJ_KEY: &str = "self_attn.q_proj";
pub const O_PROJ_KEY: &str = "self_attn.o_proj";

/// Key of an expert sub-operator input, e.g. `expert_key(2, "w1")`.
pub fn expert_key(expert: usize, leaf: &str) -> String {
    format!("block_sparse_moe.experts.{expert}.{leaf}")
}

/// Operator name -> captured input activation.
#[derive(Debug, Clone, Default)]
pub struct InputFeatures {
    features: HashMap<String, Tensor>,
}

impl InputFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `tensor` under `key`, replacing any previous sample.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.features.insert(key.into(), tensor);
    }

    /// Append a sample; repeated records for one key concatenate along dim 0.
    pub fn record(&mut self, key: &str, tensor: &Tensor) -> Result<()> {
        let merged = match self.features.get(key) {
            Some(prev) => Tensor::cat(&[prev, tensor], 0)?,
            None => tensor.clone(),
        };
        self.features.insert(key.to_string(), merged);
        Ok(())
    }

    /// Look up a sample. Absence is a caller contract violation.
    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.features
            .get(key)
            .ok_or_else(|| FuseError::MissingActivation(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.features.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}
