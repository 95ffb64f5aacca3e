//! Error types for BitChat
//!
//! A single crate-level error enum plus category metadata used by the
//! monitoring counters. Wire-level decode failures keep their own typed
//! enum (`protocol::DecodeError`) so the router can drop malformed input
//! without stringifying anything.

use thiserror::Error;

use crate::protocol::DecodeError;

/// Result type alias for BitChat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport and mesh routing errors
    Network,
    /// Cryptographic and session errors
    Security,
    /// Wire protocol violations
    Protocol,
    /// Queue/cache exhaustion
    Resources,
    /// Configuration and setup errors
    Configuration,
    /// Internal invariant failures
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Resources)
    }
}

/// BitChat error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Backpressure: {0}")]
    Backpressure(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error category for monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Network(_) | Self::Transport(_) | Self::NotConnected(_)
            | Self::Timeout(_) => ErrorCategory::Network,
            Self::Crypto(_) | Self::Noise(_) | Self::InvalidPublicKey(_)
            | Self::InvalidSignature(_) | Self::SessionNotFound | Self::Keystore(_) => {
                ErrorCategory::Security
            }
            Self::Decode(_) | Self::Protocol(_) | Self::InvalidState(_)
            | Self::InvalidInput(_) => ErrorCategory::Protocol,
            Self::ResourceExhausted(_) | Self::Backpressure(_) => ErrorCategory::Resources,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::Network("link lost".to_string());
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.is_retryable());

        let err = Error::Crypto("bad key".to_string());
        assert_eq!(err.category(), ErrorCategory::Security);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_error_wraps() {
        let err: Error = DecodeError::TooShort { expected: 35, actual: 3 }.into();
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }
}
