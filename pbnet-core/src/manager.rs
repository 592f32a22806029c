//! Per-connection role policy.
//!
//! An endpoint reports everything that happens on its connection to its
//! [`Manager`]. The client and server roles implement it differently; the
//! failure callbacks default to logging and closing the endpoint.

use crate::endpoint::Endpoint;
use crate::protocol::Protocol;
use std::sync::Arc;

/// Callbacks an endpoint invokes on its owner.
///
/// All callbacks run synchronously on the task that observed the event
/// (usually the endpoint's decode task, or a timer task for timeouts).
pub trait Manager: Send + Sync + 'static {
    /// The stream is connected and the decode loop is about to start.
    fn endpoint_ready(&self, endpoint: &Arc<Endpoint>);

    /// The endpoint closed. Invoked exactly once per endpoint.
    fn endpoint_closed(&self, endpoint: &Arc<Endpoint>);

    fn session_started(&self, endpoint: &Arc<Endpoint>);

    fn session_stopped(&self, endpoint: &Arc<Endpoint>);

    /// The peer addressed a protocol that is not running here.
    ///
    /// To accept, register (and usually start) `protocol` on the endpoint
    /// before returning `true`. Returning `false` makes the message a
    /// protocol violation.
    fn protocol_requested(&self, endpoint: &Arc<Endpoint>, protocol: Arc<dyn Protocol>) -> bool;

    /// The stream ended without a completed session teardown.
    fn endpoint_disconnected_abruptly(&self, endpoint: &Arc<Endpoint>);

    fn endpoint_sent_invalid_message(&self, endpoint: &Arc<Endpoint>) {
        tracing::warn!(
            "[{}] Invalid message from {}, closing",
            endpoint.id(),
            endpoint.remote()
        );
        endpoint.close();
    }

    fn endpoint_timed_out(&self, endpoint: &Arc<Endpoint>, protocol: &str) {
        tracing::warn!(
            "[{}] {} timed out waiting for {}, closing",
            endpoint.id(),
            protocol,
            endpoint.remote()
        );
        endpoint.close();
    }

    fn protocol_violation(&self, endpoint: &Arc<Endpoint>, protocol: &str) {
        tracing::warn!(
            "[{}] Protocol violation in {} from {}, closing",
            endpoint.id(),
            protocol,
            endpoint.remote()
        );
        endpoint.close();
    }
}

/// Lifecycle notifications the roles publish to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    EndpointReady(Arc<Endpoint>),
    SessionStarted(Arc<Endpoint>),
    SessionStopped(Arc<Endpoint>),
    /// A session ended in failure (timeout, invalid message, violation or
    /// abrupt disconnect).
    SessionError { endpoint: Arc<Endpoint>, reason: String },
    ProtocolRequested { endpoint: Arc<Endpoint>, protocol: String },
    EndpointClosed(Arc<Endpoint>),
}

impl SessionEvent {
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        match self {
            SessionEvent::EndpointReady(endpoint)
            | SessionEvent::SessionStarted(endpoint)
            | SessionEvent::SessionStopped(endpoint)
            | SessionEvent::EndpointClosed(endpoint) => endpoint,
            SessionEvent::SessionError { endpoint, .. }
            | SessionEvent::ProtocolRequested { endpoint, .. } => endpoint,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::EndpointReady(_) => "endpoint_ready",
            SessionEvent::SessionStarted(_) => "session_started",
            SessionEvent::SessionStopped(_) => "session_stopped",
            SessionEvent::SessionError { .. } => "session_error",
            SessionEvent::ProtocolRequested { .. } => "protocol_requested",
            SessionEvent::EndpointClosed(_) => "endpoint_closed",
        }
    }
}
