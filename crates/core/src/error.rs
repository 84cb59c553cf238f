use thiserror::Error;

/// Result type alias using [`FuseError`].
pub type Result<T> = std::result::Result<T, FuseError>;

/// Errors raised while discovering scale groups or fusing a model.
#[derive(Error, Debug)]
pub enum FuseError {
    /// The model does not have the decoder-layer shape the operation expects
    /// (including a model whose layers were already fused).
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),

    /// A captured activation sample required for discovery is absent.
    #[error("missing activation sample for `{0}`")]
    MissingActivation(String),

    #[error("weight handle {index} does not belong to this arena")]
    UnknownWeight { index: usize },

    #[error("weight `{name}` (handle {index}) was released")]
    ReleasedWeight { index: usize, name: String },

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("sequence length {requested} exceeds max_seq_len {max}")]
    SequenceTooLong { requested: usize, max: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
