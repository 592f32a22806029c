//! Server error types.

use crate::config::ConfigError;
use pbnet_core::EndpointError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),
}
