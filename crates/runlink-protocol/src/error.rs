//! Error types for runlink clients.

use thiserror::Error;

/// Errors raised while building endpoints or talking to the backend.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("channel not open")]
    NotConnected,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<url::ParseError> for LinkError {
    fn from(value: url::ParseError) -> Self {
        Self::InvalidEndpoint(value.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Convenience result type for runlink operations.
pub type LinkResult<T> = Result<T, LinkError>;
