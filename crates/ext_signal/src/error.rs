//! Error types for signals

use ext_variant::VariantError;
use thiserror::Error;

/// Result type for signal operations
pub type Result<T> = std::result::Result<T, SignalError>;

/// Errors raised by signal operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    /// Callable already attached
    #[error("Callable {callable} is already connected to signal '{signal}'")]
    AlreadyConnected { signal: String, callable: u64 },

    /// Signal was closed
    #[error("Signal '{0}' is closed")]
    Closed(String),

    /// Engine-side signal failed
    #[error("Engine signal '{signal}' failed: {message}")]
    Backend { signal: String, message: String },

    /// Relay thread could not start
    #[error("Failed to spawn relay for signal '{signal}': {message}")]
    Spawn { signal: String, message: String },

    /// Consumer invocation failed
    #[error(transparent)]
    Callable(#[from] VariantError),
}

impl SignalError {
    /// Create a backend error
    pub fn backend(signal: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            signal: signal.to_owned(),
            message: message.into(),
        }
    }
}
