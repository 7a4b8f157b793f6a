//! Unified error handling for Parley
//!
//! This module provides a centralized error type for the whole library,
//! ensuring consistent error handling across the core, discovery and
//! transport subsystems.

use thiserror::Error;

/// Main error type for Parley operations
#[derive(Debug, Error)]
pub enum ParleyError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not available for the node role
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Transport layer errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Discovery layer errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Convenience type alias for Results using ParleyError
pub type ParleyResult<T> = std::result::Result<T, ParleyError>;

/// Short alias — `Result<T>` is equivalent to `ParleyResult<T>`
pub type Result<T> = ParleyResult<T>;

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        ParleyError::Serialization(err.to_string())
    }
}

// Helper methods
impl ParleyError {
    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        ParleyError::InvalidInput(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        ParleyError::Unsupported(msg.into())
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        ParleyError::Transport(msg.into())
    }

    /// Create a discovery error
    pub fn discovery<S: Into<String>>(msg: S) -> Self {
        ParleyError::Discovery(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        ParleyError::Timeout(msg.into())
    }
}
