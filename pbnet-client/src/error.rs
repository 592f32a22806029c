//! Client error types.

use pbnet_core::{CloseReason, EndpointError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Every connect attempt failed.
    #[error("gave up connecting to {target} after {attempts} attempts")]
    RetriesExhausted { attempts: u32, target: String },

    /// The connection ended before the client got what it needed.
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    /// The server answered a request with an error event.
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("client task failed: {0}")]
    Task(String),
}
