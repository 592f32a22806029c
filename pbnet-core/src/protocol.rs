//! Protocol abstraction and the name → factory registry.
//!
//! A protocol is one conversational behavior bound to one endpoint. Inbound
//! messages are routed to it by name. Its lifecycle only moves forward:
//! registered → running → stopped.

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::event::EventProtocol;
use crate::keepalive::KeepAliveProtocol;
use crate::session::SessionProtocol;
use pbnet_protocol::{Message, MessageKind, EVENT_PROTOCOL, KEEPALIVE_PROTOCOL, SESSION_PROTOCOL};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const REGISTERED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle state of a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Registered,
    Running,
    Stopped,
}

/// State every protocol shares: its name, lifecycle and a non-owning
/// reference back to the endpoint it runs on.
pub struct ProtocolLink {
    name: String,
    endpoint: Weak<Endpoint>,
    state: AtomicU8,
}

impl ProtocolLink {
    pub fn new(name: impl Into<String>, endpoint: &Arc<Endpoint>) -> Self {
        Self {
            name: name.into(),
            endpoint: Arc::downgrade(endpoint),
            state: AtomicU8::new(REGISTERED),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProtocolState {
        match self.state.load(Ordering::SeqCst) {
            REGISTERED => ProtocolState::Registered,
            RUNNING => ProtocolState::Running,
            _ => ProtocolState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STOPPED
    }

    /// Moves the protocol to running.
    ///
    /// The protocol must already be registered with a live endpoint. A stopped
    /// protocol cannot be restarted.
    pub fn begin(&self) -> Result<Arc<Endpoint>, EndpointError> {
        let endpoint = self.endpoint()?;
        let registered = endpoint
            .protocol(&self.name)
            .is_some_and(|p| std::ptr::eq(p.link(), self));
        if !registered {
            return Err(EndpointError::ProtocolNotRegistered(self.name.clone()));
        }

        match self
            .state
            .compare_exchange(REGISTERED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(endpoint),
            Err(RUNNING) => Err(EndpointError::ProtocolAlreadyRunning(self.name.clone())),
            Err(_) => Err(EndpointError::Unavailable),
        }
    }

    /// Moves the protocol to stopped. Returns whether it was running.
    pub fn finish(&self) -> bool {
        self.state.swap(STOPPED, Ordering::SeqCst) == RUNNING
    }

    /// The endpoint this protocol runs on, unless it is gone or closing.
    pub fn endpoint(&self) -> Result<Arc<Endpoint>, EndpointError> {
        match self.endpoint.upgrade() {
            Some(endpoint) if !endpoint.is_closing() => Ok(endpoint),
            _ => Err(EndpointError::Unavailable),
        }
    }

    /// Sends a message of the given kind under this protocol's name.
    pub fn send(&self, kind: MessageKind, body: Value) -> Result<(), EndpointError> {
        let message = Message {
            protocol: self.name.clone(),
            kind,
            body,
        };
        self.endpoint()?.send(&message)
    }

    /// Returns an error unless the protocol is running.
    pub fn ensure_running(&self) -> Result<(), EndpointError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EndpointError::ProtocolNotRunning(self.name.clone()))
        }
    }
}

impl fmt::Debug for ProtocolLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolLink")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// A unit of conversational behavior running on one endpoint.
pub trait Protocol: Send + Sync + 'static {
    fn link(&self) -> &ProtocolLink;

    fn name(&self) -> &str {
        self.link().name()
    }

    fn is_running(&self) -> bool {
        self.link().is_running()
    }

    /// Starts the initiating side of the protocol.
    fn start_as_client(&self) -> Result<(), EndpointError>;

    /// Starts the responding side of the protocol.
    fn start_as_server(&self) -> Result<(), EndpointError>;

    /// Makes the protocol inert. Idempotent.
    fn stop(&self);

    /// The request/reply side of this protocol, if it has one.
    fn as_request_reply(&self) -> Option<&dyn RequestReply> {
        None
    }

    /// Converts into `Any` for downcasting to the concrete protocol.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Request/reply message exchange.
pub trait RequestReply: Protocol {
    fn receive_request(&self, message: Message) -> Result<(), EndpointError>;

    fn receive_reply(&self, message: Message) -> Result<(), EndpointError>;

    fn send_request(&self, body: Value) -> Result<(), EndpointError> {
        self.link().send(MessageKind::Request, body)
    }

    fn send_reply(&self, body: Value) -> Result<(), EndpointError> {
        self.link().send(MessageKind::Reply, body)
    }
}

/// Builds a protocol instance for an endpoint.
pub type ProtocolFactory = Arc<dyn Fn(&Arc<Endpoint>) -> Arc<dyn Protocol> + Send + Sync>;

/// Known protocols by name.
///
/// When a message arrives for a protocol that is not running on the endpoint,
/// the endpoint builds a candidate from here and asks its manager whether to
/// accept it.
#[derive(Clone)]
pub struct ProtocolRegistry {
    factories: HashMap<String, ProtocolFactory>,
}

impl ProtocolRegistry {
    /// A registry with the built-in session, keepalive and event protocols.
    pub fn new() -> Self {
        Self::empty()
            .with_protocol(SESSION_PROTOCOL, |ep| SessionProtocol::new(ep))
            .with_protocol(KEEPALIVE_PROTOCOL, |ep| KeepAliveProtocol::new(ep))
            .with_protocol(EVENT_PROTOCOL, |ep| EventProtocol::new(ep))
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F, P>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Arc<Endpoint>) -> Arc<P> + Send + Sync + 'static,
        P: Protocol,
    {
        let factory: ProtocolFactory =
            Arc::new(move |endpoint: &Arc<Endpoint>| -> Arc<dyn Protocol> { factory(endpoint) });
        self.factories.insert(name.into(), factory);
    }

    pub fn with_protocol<F, P>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Arc<Endpoint>) -> Arc<P> + Send + Sync + 'static,
        P: Protocol,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str, endpoint: &Arc<Endpoint>) -> Option<Arc<dyn Protocol>> {
        self.factories.get(name).map(|factory| factory(endpoint))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.names())
            .finish()
    }
}
