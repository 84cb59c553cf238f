//! Per-architecture hooks an activation-aware quantizer drives.

use candle_core::Device;

use super::capture::InputFeatures;
use super::groups::ScaleGroup;
use crate::error::Result;
use crate::layers::LayerKwargs;
use crate::models::MoeDecoderLayer;
use crate::weights::WeightArena;

/// Whether a layer's activation function output can be scaled directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActScaling {
    pub is_scalable: bool,
    /// Name of the activation operator when scalable.
    pub scale_name: Option<String>,
    /// Number of channels the activation scale covers.
    pub scale_shape: Option<usize>,
}

impl ActScaling {
    pub fn not_scalable() -> Self {
        Self {
            is_scalable: false,
            scale_name: None,
            scale_shape: None,
        }
    }

    pub fn scalable(scale_name: impl Into<String>, scale_shape: usize) -> Self {
        Self {
            is_scalable: true,
            scale_name: Some(scale_name.into()),
            scale_shape: Some(scale_shape),
        }
    }
}

/// Model-family adapter for calibration and fusion.
pub trait AwqModel {
    type Layer: MoeDecoderLayer;

    /// Type name of the decoder layers the quantizer walks.
    const LAYER_TYPE: &'static str;
    /// Config key bounding the fused model's sequence length.
    const MAX_NEW_TOKENS_KEY: &'static str;

    fn arena(&self) -> &WeightArena;

    /// Decoder layers in order. Fails once the model is fused.
    fn model_layers(&self) -> Result<&[Self::Layer]>;

    fn act_for_scaling(&self, layer: &Self::Layer) -> ActScaling;

    /// Move the token embedding to `device`.
    fn move_embed(&mut self, device: &Device) -> Result<()>;

    fn layers_for_scaling(
        &self,
        layer: &Self::Layer,
        input_feat: &InputFeatures,
        module_kwargs: &LayerKwargs,
    ) -> Result<Vec<ScaleGroup>>;

    /// Replace the model body with its fused form. Succeeds at most once.
    fn fuse_layers(&mut self) -> Result<()>;
}
