//! Error taxonomy for the adapter backbone.
//!
//! Tensor-level modules return `candle_core::Result` like the rest of the
//! model code; shape invariant violations raised there surface through
//! [`AdapterError::Tensor`]. Construction and forward-time policy checks use
//! the dedicated variants so callers can tell them apart.

/// Errors raised while building or running the backbone.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Rejected at construction, before any parameter is created.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A feature the backbone knows about but does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AdapterError::Configuration(msg.into())
    }
}
