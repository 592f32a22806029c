//! Test helpers: a manager that records its callbacks, and in-memory streams.

use crate::context::EndpointContext;
use crate::endpoint::Endpoint;
use crate::manager::Manager;
use crate::protocol::Protocol;
use parking_lot::Mutex;
use pbnet_protocol::{Decoder, Message};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ready,
    Closed,
    SessionStarted,
    SessionStopped,
    Requested(String),
    Abrupt,
    InvalidMessage,
    TimedOut(String),
    Violation(String),
}

/// Records every callback. Accepts requested protocols whose names it was
/// given, starting them as server, and closes on session stop.
pub struct RecordingManager {
    calls: Mutex<Vec<Call>>,
    accept: HashSet<String>,
    changed: Notify,
}

impl RecordingManager {
    pub fn new() -> Arc<Self> {
        Self::accepting(&[])
    }

    pub fn accepting(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            accept: names.iter().map(|n| n.to_string()).collect(),
            changed: Notify::new(),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub async fn wait_for(&self, call: &Call) {
        loop {
            let changed = self.changed.notified();
            if self.calls.lock().contains(call) {
                return;
            }
            changed.await;
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
        self.changed.notify_waiters();
    }
}

impl Manager for RecordingManager {
    fn endpoint_ready(&self, _endpoint: &Arc<Endpoint>) {
        self.record(Call::Ready);
    }

    fn endpoint_closed(&self, _endpoint: &Arc<Endpoint>) {
        self.record(Call::Closed);
    }

    fn session_started(&self, _endpoint: &Arc<Endpoint>) {
        self.record(Call::SessionStarted);
    }

    fn session_stopped(&self, endpoint: &Arc<Endpoint>) {
        self.record(Call::SessionStopped);
        endpoint.close();
    }

    fn protocol_requested(&self, endpoint: &Arc<Endpoint>, protocol: Arc<dyn Protocol>) -> bool {
        self.record(Call::Requested(protocol.name().to_string()));
        if !self.accept.contains(protocol.name()) {
            return false;
        }
        endpoint.handle_protocol(protocol.clone()).is_ok() && protocol.start_as_server().is_ok()
    }

    fn endpoint_disconnected_abruptly(&self, _endpoint: &Arc<Endpoint>) {
        self.record(Call::Abrupt);
    }

    fn endpoint_sent_invalid_message(&self, endpoint: &Arc<Endpoint>) {
        self.record(Call::InvalidMessage);
        endpoint.close();
    }

    fn endpoint_timed_out(&self, endpoint: &Arc<Endpoint>, protocol: &str) {
        self.record(Call::TimedOut(protocol.to_string()));
        endpoint.close();
    }

    fn protocol_violation(&self, endpoint: &Arc<Endpoint>, protocol: &str) {
        self.record(Call::Violation(protocol.to_string()));
        endpoint.close();
    }
}

/// Two endpoints connected to each other in memory.
pub fn duplex_endpoints(
    client: Arc<dyn Manager>,
    server: Arc<dyn Manager>,
    ctx: &EndpointContext,
) -> (Arc<Endpoint>, Arc<Endpoint>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Endpoint::spawn(a, "server", client, ctx.clone()),
        Endpoint::spawn(b, "client", server, ctx.clone()),
    )
}

/// An endpoint whose peer is a raw stream the test drives by hand.
pub fn raw_endpoint(
    manager: Arc<dyn Manager>,
    ctx: &EndpointContext,
) -> (Arc<Endpoint>, DuplexStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Endpoint::spawn(a, "peer", manager, ctx.clone()), b)
}

/// Reads a raw stream to its end and decodes every message on it.
pub async fn read_messages(mut stream: DuplexStream) -> Vec<Message> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    let mut decoder = Decoder::new();
    decoder.extend(&bytes);
    let mut messages = Vec::new();
    while let Some(message) = decoder.decode_message().unwrap() {
        messages.push(message);
    }
    messages
}

/// Fails the test if `fut` does not finish within five minutes.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(300), fut)
        .await
        .expect("timed out")
}
