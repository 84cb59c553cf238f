pub mod attention;
pub mod linear;
pub mod normalization;
pub mod rotary;

pub use attention::{
    causal_mask, repeat_kv, scaled_dot_product_attention, KvCache, LayerKwargs,
};
pub use linear::{Embedding, Linear};
pub use normalization::{FusedRmsNorm, RmsNorm};
pub use rotary::RotaryEmbedding;
