//! Endpoint: one live connection and the protocols multiplexed over it.
//!
//! Each endpoint owns two tasks. The reader task runs the decode loop and
//! dispatches every inbound message, in arrival order, to the protocol named
//! in it. The writer task drains an ordered queue of encoded frames, so sends
//! from any task are atomic and FIFO.

use crate::context::{EndpointContext, ProtocolSettings};
use crate::error::EndpointError;
use crate::event::EventProtocol;
use crate::manager::Manager;
use crate::protocol::Protocol;
use crate::session::SessionProtocol;
use crate::timer::Timers;
use bytes::BytesMut;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use pbnet_protocol::{Decoder, Encoder, Message, MessageKind, EVENT_PROTOCOL, SESSION_PROTOCOL};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 8192;

/// Why an endpoint closed. The first recorded cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local side without a more specific cause.
    Local,
    /// Closed after the session teardown completed.
    SessionStopped,
    /// The stream ended or failed without a completed teardown.
    Disconnected,
    /// A protocol's liveness timer expired.
    TimedOut,
    /// The peer sent bytes that do not decode into a message.
    InvalidMessage,
    /// The peer sent a message the protocol does not allow.
    ProtocolViolation,
}

impl CloseReason {
    /// Whether the connection was lost rather than ended on purpose.
    pub fn is_abrupt(&self) -> bool {
        matches!(self, CloseReason::Disconnected | CloseReason::TimedOut)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Local => "closed locally",
            CloseReason::SessionStopped => "session stopped",
            CloseReason::Disconnected => "disconnected",
            CloseReason::TimedOut => "timed out",
            CloseReason::InvalidMessage => "invalid message",
            CloseReason::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

/// Application event handler.
pub type EventHandler = Arc<dyn Fn(&Arc<Endpoint>, &Value) + Send + Sync>;

/// One live connection.
pub struct Endpoint {
    id: String,
    remote: String,
    peer_id: RwLock<Option<String>>,
    manager: Arc<dyn Manager>,
    context: EndpointContext,

    /// Protocols by name.
    protocols: Mutex<HashMap<String, Arc<dyn Protocol>>>,

    /// Event handlers by event name.
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,

    /// Writer queue; taken on close.
    outbound: Mutex<Option<mpsc::UnboundedSender<BytesMut>>>,

    closing: AtomicBool,
    session_started: AtomicBool,
    teardown_complete: AtomicBool,
    cause: Mutex<Option<CloseReason>>,
    closed: watch::Sender<Option<CloseReason>>,

    /// Held while a message is dispatched and while closing.
    dispatch: ReentrantMutex<()>,
}

impl Endpoint {
    /// Takes ownership of a connected stream and starts the reader and writer
    /// tasks. The manager's `endpoint_ready` runs on the reader task before
    /// the first read.
    pub fn spawn<S>(
        stream: S,
        remote: impl Into<String>,
        manager: Arc<dyn Manager>,
        context: EndpointContext,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);

        let endpoint = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            remote: remote.into(),
            peer_id: RwLock::new(None),
            manager,
            context,
            protocols: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            outbound: Mutex::new(Some(tx)),
            closing: AtomicBool::new(false),
            session_started: AtomicBool::new(false),
            teardown_complete: AtomicBool::new(false),
            cause: Mutex::new(None),
            closed,
            dispatch: ReentrantMutex::new(()),
        });

        tracing::info!("[{}] Endpoint connected to {}", endpoint.id, endpoint.remote);

        tokio::spawn(write_loop(writer, rx, endpoint.id.clone()));
        tokio::spawn(endpoint.clone().read_loop(reader));

        endpoint
    }

    /// Local identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the other side.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// The other side's endpoint id, once the session handshake delivered it.
    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.read().clone()
    }

    pub(crate) fn set_peer_id(&self, id: String) {
        *self.peer_id.write() = Some(id);
    }

    pub fn manager(&self) -> &Arc<dyn Manager> {
        &self.manager
    }

    pub fn settings(&self) -> ProtocolSettings {
        self.context.settings
    }

    pub fn timers(&self) -> &Timers {
        &self.context.timers
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Whether `close()` has finished.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Why the endpoint closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    /// Waits until the endpoint is closed and returns why.
    pub async fn wait_closed(&self) -> CloseReason {
        let mut closed = self.closed.subscribe();
        loop {
            let current = *closed.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if closed.changed().await.is_err() {
                return CloseReason::Local;
            }
        }
    }

    /// Queues a message for the writer task.
    pub fn send(&self, message: &Message) -> Result<(), EndpointError> {
        if self.is_closing() {
            return Err(EndpointError::Unavailable);
        }
        let frame = Encoder::encode_message(message)?;

        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(EndpointError::Unavailable)?;
        tx.send(frame).map_err(|_| EndpointError::Unavailable)?;

        tracing::debug!(
            "[{}] Sent {} for {}",
            self.id,
            message.kind,
            message.protocol
        );
        Ok(())
    }

    /// Registers a protocol under its name.
    pub fn handle_protocol(&self, protocol: Arc<dyn Protocol>) -> Result<(), EndpointError> {
        let name = protocol.name().to_string();
        let mut protocols = self.protocols.lock();
        if self.is_closing() {
            return Err(EndpointError::Unavailable);
        }
        if let Some(existing) = protocols.get(&name) {
            if !existing.link().is_stopped() {
                return Err(EndpointError::ProtocolAlreadyRunning(name));
            }
        }
        tracing::debug!("[{}] Registered {}", self.id, name);
        protocols.insert(name, protocol);
        Ok(())
    }

    pub fn protocol(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.lock().get(name).cloned()
    }

    /// Looks up a protocol and downcasts it to its concrete type.
    pub fn protocol_as<P: Protocol>(&self, name: &str) -> Option<Arc<P>> {
        self.protocol(name)?.into_any().downcast::<P>().ok()
    }

    pub fn is_session_started(&self) -> bool {
        self.session_started.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_session_started(&self) {
        self.session_started.store(true, Ordering::SeqCst);
    }

    /// Records a completed teardown: a stream end from now on is ordinary.
    pub(crate) fn mark_session_stopped(&self) {
        self.session_started.store(false, Ordering::SeqCst);
        self.teardown_complete.store(true, Ordering::SeqCst);
        self.record_cause(CloseReason::SessionStopped);
    }

    /// Starts the session teardown.
    pub fn stop_session(&self) -> Result<(), EndpointError> {
        let session = self
            .protocol_as::<SessionProtocol>(SESSION_PROTOCOL)
            .ok_or_else(|| EndpointError::ProtocolNotRunning(SESSION_PROTOCOL.to_string()))?;
        session.stop_session()
    }

    /// Sends an application event to the peer.
    pub fn emit<T: Serialize>(&self, event: &str, args: &T) -> Result<(), EndpointError> {
        let events = self
            .protocol_as::<EventProtocol>(EVENT_PROTOCOL)
            .ok_or_else(|| EndpointError::ProtocolNotRunning(EVENT_PROTOCOL.to_string()))?;
        events.emit(event, serde_json::to_value(args)?)
    }

    /// Attaches a handler for an application event. Handlers run on the
    /// decode task in arrival order.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Arc<Endpoint>, &Value) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub(crate) fn fire(self: &Arc<Self>, event: &str, args: &Value) {
        let handlers = self.handlers.read().get(event).cloned();
        match handlers {
            Some(handlers) => {
                for handler in handlers {
                    handler(self, args);
                }
            }
            None => tracing::debug!("[{}] No handler for event {}", self.id, event),
        }
    }

    /// A protocol's liveness timer expired.
    pub fn report_timeout(self: &Arc<Self>, protocol: &str) {
        if self.is_closing() {
            return;
        }
        self.record_cause(CloseReason::TimedOut);
        self.manager.endpoint_timed_out(self, protocol);
        self.close();
    }

    /// Closes the endpoint. Idempotent.
    ///
    /// Every registered protocol is stopped before this returns, queued frames
    /// are flushed before the stream is released, and the manager hears
    /// `endpoint_closed` exactly once.
    pub fn close(self: &Arc<Self>) {
        let _guard = self.dispatch.lock();
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = self.cause.lock().unwrap_or(CloseReason::Local);

        let protocols: Vec<Arc<dyn Protocol>> = {
            let mut protocols = self.protocols.lock();
            protocols.drain().map(|(_, p)| p).collect()
        };
        for protocol in &protocols {
            protocol.stop();
        }

        // Dropping the sender lets the writer flush what is queued and shut down.
        self.outbound.lock().take();
        self.closed.send_replace(Some(reason));

        tracing::info!("[{}] Endpoint to {} closed ({})", self.id, self.remote, reason);
        self.manager.endpoint_closed(self);
    }

    fn record_cause(&self, reason: CloseReason) {
        let mut cause = self.cause.lock();
        if cause.is_none() {
            *cause = Some(reason);
        }
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut closed = self.closed.subscribe();
        if self.is_closing() {
            return;
        }
        self.manager.endpoint_ready(&self);

        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if self.is_closing() {
                return;
            }

            let read = tokio::select! {
                biased;
                _ = closed.changed() => return,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    self.stream_ended(None);
                    return;
                }
                Ok(n) => {
                    tracing::debug!("[{}] Received {} bytes", self.id, n);
                    decoder.extend(&buf[..n]);
                }
                Err(e) => {
                    self.stream_ended(Some(e));
                    return;
                }
            }

            loop {
                match decoder.decode_message() {
                    Ok(Some(message)) => {
                        if !self.dispatch(message) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Undecodable frame: {}", self.id, e);
                        self.report_invalid_message();
                        return;
                    }
                }
            }
        }
    }

    /// Routes one message. Returns whether the decode loop should continue.
    fn dispatch(self: &Arc<Self>, message: Message) -> bool {
        let _guard = self.dispatch.lock();
        if self.is_closing() {
            return false;
        }

        let name = message.protocol.clone();
        let protocol = match self.protocol(&name) {
            Some(protocol) => protocol,
            None => match self.request_protocol(&name) {
                Some(protocol) => protocol,
                None => {
                    self.report_violation(&name, "no such protocol");
                    return false;
                }
            },
        };

        if !protocol.is_running() {
            self.report_violation(&name, "protocol is not running");
            return false;
        }
        let Some(handler) = protocol.as_request_reply() else {
            self.report_violation(&name, "protocol does not accept messages");
            return false;
        };

        tracing::debug!("[{}] Dispatching {} for {}", self.id, message.kind, name);
        let result = match message.kind {
            MessageKind::Request => handler.receive_request(message),
            MessageKind::Reply => handler.receive_reply(message),
        };

        match result {
            Ok(()) => !self.is_closing(),
            Err(EndpointError::Unavailable) => false,
            Err(e @ EndpointError::Violation { .. }) => {
                self.report_violation(&name, &e.to_string());
                false
            }
            Err(e) if e.is_undecodable() => {
                tracing::warn!("[{}] Undecodable {} body: {}", self.id, name, e);
                self.report_invalid_message();
                false
            }
            Err(e) => {
                tracing::warn!("[{}] {} failed to handle message: {}", self.id, name, e);
                !self.is_closing()
            }
        }
    }

    /// Builds a candidate for an unknown protocol and lets the manager decide.
    fn request_protocol(self: &Arc<Self>, name: &str) -> Option<Arc<dyn Protocol>> {
        let candidate = self.context.registry.create(name, self)?;
        if !self.manager.protocol_requested(self, candidate) {
            tracing::debug!("[{}] Manager refused {}", self.id, name);
            return None;
        }
        self.protocol(name)
    }

    fn report_violation(self: &Arc<Self>, protocol: &str, reason: &str) {
        tracing::warn!(
            "[{}] Protocol violation in {} from {}: {}",
            self.id,
            protocol,
            self.remote,
            reason
        );
        self.record_cause(CloseReason::ProtocolViolation);
        self.manager.protocol_violation(self, protocol);
        self.close();
    }

    fn report_invalid_message(self: &Arc<Self>) {
        self.record_cause(CloseReason::InvalidMessage);
        self.manager.endpoint_sent_invalid_message(self);
        self.close();
    }

    fn stream_ended(self: &Arc<Self>, error: Option<io::Error>) {
        if self.is_closing() {
            return;
        }
        if self.teardown_complete.load(Ordering::SeqCst) {
            tracing::debug!("[{}] Stream ended after session teardown", self.id);
            self.close();
            return;
        }

        match error {
            Some(e) => tracing::warn!("[{}] Connection to {} failed: {}", self.id, self.remote, e),
            None => tracing::warn!(
                "[{}] Connection to {} ended without session teardown",
                self.id,
                self.remote
            ),
        }
        self.record_cause(CloseReason::Disconnected);
        self.manager.endpoint_disconnected_abruptly(self);
        self.close();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("session_started", &self.is_session_started())
            .field("closing", &self.is_closing())
            .finish()
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<BytesMut>, id: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("[{}] Write failed: {}", id, e);
            return;
        }
        tracing::debug!("[{}] Wrote {} bytes", id, frame.len());
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("[{}] Shutdown failed: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalive::KeepAliveProtocol;
    use crate::testing::{raw_endpoint, read_messages, within, Call, RecordingManager};
    use pbnet_protocol::{KEEPALIVE_PROTOCOL, MAX_PAYLOAD_SIZE};
    use serde_json::json;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_close_stops_every_protocol() {
        let manager = RecordingManager::new();
        let (endpoint, _peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        let keepalive = KeepAliveProtocol::new(&endpoint);
        let events = EventProtocol::new(&endpoint);
        endpoint.handle_protocol(keepalive.clone()).unwrap();
        endpoint.handle_protocol(events.clone()).unwrap();
        keepalive.start_as_server().unwrap();
        events.start_as_server().unwrap();

        endpoint.close();
        assert!(!keepalive.is_running());
        assert!(!events.is_running());
        assert!(endpoint.is_closed());
        assert!(matches!(
            endpoint.send(&Message::request(EVENT_PROTOCOL, json!({}))),
            Err(EndpointError::Unavailable)
        ));
        assert!(matches!(
            endpoint.handle_protocol(KeepAliveProtocol::new(&endpoint)),
            Err(EndpointError::Unavailable)
        ));

        endpoint.close();
        assert_eq!(endpoint.wait_closed().await, CloseReason::Local);
        assert_eq!(manager.count(&Call::Closed), 1);
    }

    #[tokio::test]
    async fn test_no_double_registration() {
        let (endpoint, _peer) = raw_endpoint(RecordingManager::new(), &EndpointContext::new());

        let first = KeepAliveProtocol::new(&endpoint);
        endpoint.handle_protocol(first.clone()).unwrap();
        assert!(matches!(
            endpoint.handle_protocol(KeepAliveProtocol::new(&endpoint)),
            Err(EndpointError::ProtocolAlreadyRunning(name)) if name == KEEPALIVE_PROTOCOL
        ));

        // A stopped protocol can be replaced.
        first.stop();
        endpoint.handle_protocol(KeepAliveProtocol::new(&endpoint)).unwrap();
    }

    #[tokio::test]
    async fn test_send_is_fifo() {
        let (endpoint, peer) = raw_endpoint(RecordingManager::new(), &EndpointContext::new());

        let sent: Vec<Message> = (0..50)
            .map(|seq| Message::request(EVENT_PROTOCOL, json!({"event": "TICK", "args": seq})))
            .collect();
        for message in &sent {
            endpoint.send(message).unwrap();
        }
        endpoint.close();

        let received = within(read_messages(peer)).await;
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_violation() {
        let manager = RecordingManager::new();
        let (endpoint, mut peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        let frame =
            Encoder::encode_message(&Message::request("WhiteboardProtocol", json!({}))).unwrap();
        peer.write_all(&frame).await.unwrap();

        assert_eq!(
            within(endpoint.wait_closed()).await,
            CloseReason::ProtocolViolation
        );
        assert_eq!(
            manager.calls(),
            vec![
                Call::Ready,
                Call::Violation("WhiteboardProtocol".into()),
                Call::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_protocol_is_violation() {
        let manager = RecordingManager::new();
        let (endpoint, mut peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        let frame =
            Encoder::encode_message(&Message::request(KEEPALIVE_PROTOCOL, json!({}))).unwrap();
        peer.write_all(&frame).await.unwrap();

        assert_eq!(
            within(endpoint.wait_closed()).await,
            CloseReason::ProtocolViolation
        );
        assert_eq!(manager.count(&Call::Requested(KEEPALIVE_PROTOCOL.into())), 1);
        assert_eq!(manager.count(&Call::Violation(KEEPALIVE_PROTOCOL.into())), 1);
    }

    #[tokio::test]
    async fn test_accepted_protocol_receives_message() {
        let manager = RecordingManager::accepting(&[KEEPALIVE_PROTOCOL]);
        let (endpoint, mut peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        let frame =
            Encoder::encode_message(&Message::request(KEEPALIVE_PROTOCOL, json!({}))).unwrap();
        peer.write_all(&frame).await.unwrap();

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 256];
        let reply = within(async {
            loop {
                if let Some(message) = decoder.decode_message().unwrap() {
                    return message;
                }
                let n = peer.read(&mut buf).await.unwrap();
                decoder.extend(&buf[..n]);
            }
        })
        .await;

        assert_eq!(reply, Message::reply(KEEPALIVE_PROTOCOL, json!({})));
        assert!(endpoint.protocol(KEEPALIVE_PROTOCOL).unwrap().is_running());
        assert!(!endpoint.is_closing());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_invalid_message() {
        let manager = RecordingManager::new();
        let (endpoint, mut peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        peer.write_all(b"GARBAGE GARBAGE GARBAGE").await.unwrap();

        assert_eq!(
            within(endpoint.wait_closed()).await,
            CloseReason::InvalidMessage
        );
        assert_eq!(manager.count(&Call::InvalidMessage), 1);
        assert_eq!(manager.count(&Call::Closed), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_invalid_message() {
        let manager = RecordingManager::new();
        let (endpoint, mut peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        let mut header = Vec::new();
        header.extend_from_slice(b"PBNX");
        header.extend_from_slice(&1u16.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        peer.write_all(&header).await.unwrap();

        assert_eq!(
            within(endpoint.wait_closed()).await,
            CloseReason::InvalidMessage
        );
    }

    #[tokio::test]
    async fn test_eof_without_teardown_is_abrupt() {
        let manager = RecordingManager::new();
        let (endpoint, peer) = raw_endpoint(manager.clone(), &EndpointContext::new());

        drop(peer);

        assert_eq!(
            within(endpoint.wait_closed()).await,
            CloseReason::Disconnected
        );
        assert_eq!(
            manager.calls(),
            vec![Call::Ready, Call::Abrupt, Call::Closed]
        );
    }

    #[tokio::test]
    async fn test_read_error_is_abrupt() {
        let manager = RecordingManager::new();
        let stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let endpoint = Endpoint::spawn(stream, "mock", manager.clone(), EndpointContext::new());

        assert_eq!(
            within(endpoint.wait_closed()).await,
            CloseReason::Disconnected
        );
        assert_eq!(manager.count(&Call::Abrupt), 1);
    }

    #[tokio::test]
    async fn test_emit_requires_event_protocol() {
        let (endpoint, _peer) = raw_endpoint(RecordingManager::new(), &EndpointContext::new());
        assert!(matches!(
            endpoint.emit("SHARE_BOARD", &json!({"board": "b1"})),
            Err(EndpointError::ProtocolNotRunning(name)) if name == EVENT_PROTOCOL
        ));
        assert!(matches!(
            endpoint.stop_session(),
            Err(EndpointError::ProtocolNotRunning(name)) if name == SESSION_PROTOCOL
        ));
    }

    #[test]
    fn test_close_reason_classification() {
        assert!(CloseReason::Disconnected.is_abrupt());
        assert!(CloseReason::TimedOut.is_abrupt());
        assert!(!CloseReason::SessionStopped.is_abrupt());
        assert!(!CloseReason::ProtocolViolation.is_abrupt());
        assert_eq!(CloseReason::InvalidMessage.to_string(), "invalid message");
    }
}
