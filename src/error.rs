//! Error types for flow construction, inference, and training.

use thiserror::Error;

/// Result type for flow operations.
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors that can occur during flow operations.
///
/// Numerical degeneracy (inputs outside the model's effective support,
/// overflow during density evaluation) is deliberately *not* an error:
/// [`Flow::log_prob`](crate::Flow::log_prob) reports `-inf` and
/// [`Flow::posterior`](crate::Flow::posterior) reports `0.0` for the affected
/// entries so the rest of the batch stays usable.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Invalid or contradictory constructor arguments
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed posterior arguments
    #[error("Invalid posterior arguments: {0}")]
    Validation(String),

    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl FlowError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
