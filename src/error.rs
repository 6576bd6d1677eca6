//! Error types for poly-encoder-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected at model construction.
    #[error("config: {0}")]
    Config(String),

    /// An operation was invoked with insufficient or conflicting inputs.
    #[error("usage: {0}")]
    Usage(String),

    /// An input tensor violated its rank/shape contract.
    #[error("shape: {0}")]
    Shape(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
