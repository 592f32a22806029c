//! Session handshake.
//!
//! The initiating side sends a start request carrying its endpoint id and
//! waits for the reply; the responding side records the peer, replies and
//! reports the session as started. Either side may later tear the session
//! down with a stop request, which the other side acknowledges.

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::protocol::{Protocol, ProtocolLink, RequestReply};
use crate::timer::TimerHandle;
use parking_lot::Mutex;
use pbnet_protocol::{Message, SessionBody, SESSION_PROTOCOL};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Session handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a start request.
    Idle,
    /// Start request sent, waiting for the reply.
    Starting,
    Started,
    /// Stop request sent, waiting for the reply.
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Started => "started",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct SessionProtocol {
    link: ProtocolLink,
    this: Weak<Self>,
    state: Mutex<SessionState>,
    handshake: Mutex<Option<TimerHandle>>,
}

impl SessionProtocol {
    pub fn new(endpoint: &Arc<Endpoint>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            link: ProtocolLink::new(SESSION_PROTOCOL, endpoint),
            this: this.clone(),
            state: Mutex::new(SessionState::Idle),
            handshake: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Starts the teardown. Repeated calls while stopping are no-ops.
    pub fn stop_session(&self) -> Result<(), EndpointError> {
        self.link.ensure_running()?;
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Started => *state = SessionState::Stopping,
                SessionState::Stopping | SessionState::Stopped => return Ok(()),
                SessionState::Idle | SessionState::Starting => {
                    return Err(EndpointError::SessionNotStarted)
                }
            }
        }
        tracing::debug!("[{}] Stopping session", self.endpoint_id());
        self.send_request(body(&SessionBody::Stop)?)
    }

    fn endpoint_id(&self) -> String {
        self.link
            .endpoint()
            .map(|ep| ep.id().to_string())
            .unwrap_or_default()
    }

    fn handshake_expired(&self) {
        if !self.is_running() || self.state() != SessionState::Starting {
            return;
        }
        if let Ok(endpoint) = self.link.endpoint() {
            tracing::warn!(
                "[{}] No session reply from {}",
                endpoint.id(),
                endpoint.remote()
            );
            self.stop();
            endpoint.report_timeout(SESSION_PROTOCOL);
        }
    }

    /// Moves from `from` to `to`, or reports what the state actually was.
    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    fn started(&self, endpoint: &Arc<Endpoint>, peer_id: String) {
        tracing::info!(
            "[{}] Session started with {} ({})",
            endpoint.id(),
            peer_id,
            endpoint.remote()
        );
        endpoint.set_peer_id(peer_id);
        endpoint.mark_session_started();
        endpoint.manager().session_started(endpoint);
    }

    fn stopped(&self, endpoint: &Arc<Endpoint>) {
        tracing::info!("[{}] Session stopped", endpoint.id());
        endpoint.mark_session_stopped();
        endpoint.manager().session_stopped(endpoint);
    }
}

fn body(session: &SessionBody) -> Result<Value, EndpointError> {
    Ok(serde_json::to_value(session)?)
}

fn unexpected(kind: &str, state: SessionState) -> EndpointError {
    EndpointError::violation(SESSION_PROTOCOL, format!("unexpected {} while {}", kind, state))
}

impl Protocol for SessionProtocol {
    fn link(&self) -> &ProtocolLink {
        &self.link
    }

    fn start_as_client(&self) -> Result<(), EndpointError> {
        let endpoint = self.link.begin()?;
        *self.state.lock() = SessionState::Starting;

        self.send_request(body(&SessionBody::Start {
            endpoint_id: endpoint.id().to_string(),
        })?)?;

        let this = self.this.clone();
        let timer = endpoint
            .timers()
            .after(endpoint.settings().handshake_timeout, move || {
                if let Some(session) = this.upgrade() {
                    session.handshake_expired();
                }
            });
        *self.handshake.lock() = Some(timer);
        Ok(())
    }

    fn start_as_server(&self) -> Result<(), EndpointError> {
        self.link.begin()?;
        Ok(())
    }

    fn stop(&self) {
        self.link.finish();
        if let Some(timer) = self.handshake.lock().take() {
            timer.cancel();
        }
    }

    fn as_request_reply(&self) -> Option<&dyn RequestReply> {
        Some(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl RequestReply for SessionProtocol {
    fn receive_request(&self, message: Message) -> Result<(), EndpointError> {
        let endpoint = self.link.endpoint()?;
        match message.parse_body::<SessionBody>()? {
            SessionBody::Start { endpoint_id } => {
                self.transition(SessionState::Idle, SessionState::Started)
                    .map_err(|state| unexpected("start request", state))?;
                self.send_reply(body(&SessionBody::Start {
                    endpoint_id: endpoint.id().to_string(),
                })?)?;
                self.started(&endpoint, endpoint_id);
            }
            SessionBody::Stop => match self.transition(SessionState::Started, SessionState::Stopped)
            {
                Ok(()) => {
                    self.send_reply(body(&SessionBody::Stop)?)?;
                    self.stopped(&endpoint);
                }
                // Both sides asked at once: acknowledge and keep waiting for our reply.
                Err(SessionState::Stopping) => self.send_reply(body(&SessionBody::Stop)?)?,
                Err(state) => return Err(unexpected("stop request", state)),
            },
        }
        Ok(())
    }

    fn receive_reply(&self, message: Message) -> Result<(), EndpointError> {
        let endpoint = self.link.endpoint()?;
        match message.parse_body::<SessionBody>()? {
            SessionBody::Start { endpoint_id } => {
                self.transition(SessionState::Starting, SessionState::Started)
                    .map_err(|state| unexpected("start reply", state))?;
                if let Some(timer) = self.handshake.lock().take() {
                    timer.cancel();
                }
                self.started(&endpoint, endpoint_id);
            }
            SessionBody::Stop => {
                self.transition(SessionState::Stopping, SessionState::Stopped)
                    .map_err(|state| unexpected("stop reply", state))?;
                self.stopped(&endpoint);
            }
        }
        Ok(())
    }
}
