//! Endpoint error types.

use thiserror::Error;

/// Errors raised by endpoints and the protocols running on them.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The endpoint is closed or closing. Callers treat the endpoint as gone.
    #[error("endpoint unavailable")]
    Unavailable,

    #[error("protocol already running: {0}")]
    ProtocolAlreadyRunning(String),

    #[error("protocol not running: {0}")]
    ProtocolNotRunning(String),

    /// A protocol was started without first being handed to its endpoint.
    #[error("protocol not registered: {0}")]
    ProtocolNotRegistered(String),

    #[error("session not started")]
    SessionNotStarted,

    /// A message arrived that the protocol's state machine does not allow.
    #[error("protocol violation in {protocol}: {reason}")]
    Violation { protocol: String, reason: String },

    #[error("wire error: {0}")]
    Wire(#[from] pbnet_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EndpointError {
    pub(crate) fn violation(protocol: &str, reason: impl Into<String>) -> Self {
        EndpointError::Violation {
            protocol: protocol.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns whether a received frame or body could not be decoded.
    pub fn is_undecodable(&self) -> bool {
        matches!(self, EndpointError::Wire(_) | EndpointError::Json(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undecodable_classification() {
        assert!(EndpointError::Json(serde_json::from_str::<u8>("x").unwrap_err()).is_undecodable());
        assert!(!EndpointError::violation("SessionProtocol", "unexpected reply").is_undecodable());
        assert!(!EndpointError::Unavailable.is_undecodable());
        assert!(!EndpointError::ProtocolAlreadyRunning("KeepAliveProtocol".into()).is_undecodable());
    }

    #[test]
    fn test_display() {
        let err = EndpointError::violation("SessionProtocol", "unexpected reply");
        assert_eq!(
            err.to_string(),
            "protocol violation in SessionProtocol: unexpected reply"
        );
        assert_eq!(EndpointError::Unavailable.to_string(), "endpoint unavailable");
    }
}
