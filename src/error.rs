//! Error taxonomy for the model core.
//!
//! Construction-time configuration problems, tensor shape disagreements,
//! out-of-range lookups and unrecoverable sampling states each get their own
//! variant so callers can tell a malformed model apart from a bad request.

/// Errors produced by the model, sampler and training core.
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    /// Invalid hyperparameter combination or a request that violates the
    /// configured limits (e.g. sequence longer than the context window).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tensors handed between cooperating components disagree in rank or size.
    #[error("shape error: {0}")]
    Shape(String),

    /// Out-of-range position or token id lookup.
    #[error("index error: {0}")]
    Index(String),

    /// Degenerate probability distribution that could not be repaired.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// External tokenizer failed to load, encode or decode.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
