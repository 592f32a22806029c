//! Client role: connect, bootstrap the session and reconnect on loss.

use crate::connection::{
    connect_with_retry, ConnectionConfig, Connector, ExhaustionPolicy, TcpConnector,
};
use crate::error::ClientError;
use parking_lot::Mutex;
use pbnet_core::{
    CloseReason, Endpoint, EndpointContext, EventProtocol, KeepAliveProtocol, Manager, Protocol,
    SessionEvent, SessionProtocol,
};
use pbnet_protocol::SESSION_PROTOCOL;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default capacity for the session event channel.
const SESSION_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Initiating side of a connection.
///
/// `run` connects (with retries), starts the session as client and, once the
/// session is up, the keepalive and event protocols. An abrupt disconnect or
/// keepalive timeout starts the same cycle again on a fresh endpoint.
pub struct ClientManager<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    context: EndpointContext,
    events: broadcast::Sender<SessionEvent>,
    current: Mutex<Option<Arc<Endpoint>>>,
    endpoints_created: AtomicUsize,
}

impl ClientManager<TcpConnector> {
    /// A client that connects over TCP to `config.host:config.port`.
    pub fn tcp(config: ConnectionConfig) -> Arc<Self> {
        Self::new(TcpConnector::new(&config), config)
    }
}

impl<C: Connector> ClientManager<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Arc<Self> {
        let context = EndpointContext::new().with_settings(config.settings);
        Self::with_context(connector, config, context)
    }

    pub fn with_context(connector: C, config: ConnectionConfig, context: EndpointContext) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            config,
            context,
            events,
            current: Mutex::new(None),
            endpoints_created: AtomicUsize::new(0),
        })
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The live endpoint, if connected.
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.current.lock().clone()
    }

    /// Number of endpoints built so far, across reconnects.
    pub fn endpoints_created(&self) -> usize {
        self.endpoints_created.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn context(&self) -> &EndpointContext {
        &self.context
    }

    /// Connects and keeps the connection going until it ends for a reason
    /// other than a lost connection, or reconnecting is disabled.
    ///
    /// Returns why the last endpoint closed.
    pub async fn run(self: &Arc<Self>) -> Result<CloseReason, ClientError> {
        loop {
            let endpoint = self.establish().await?;
            let reason = endpoint.wait_closed().await;

            if reason.is_abrupt() && self.config.reconnect {
                tracing::info!(
                    "Connection to {} lost ({}), reconnecting",
                    self.connector.target(),
                    reason
                );
                continue;
            }

            tracing::info!(
                "Connection to {} finished ({})",
                self.connector.target(),
                reason
            );
            return Ok(reason);
        }
    }

    /// Ends the session if there is one, otherwise closes the endpoint, and
    /// cancels every timer.
    pub fn shutdown(&self) {
        if let Some(endpoint) = self.endpoint() {
            if endpoint.stop_session().is_err() {
                endpoint.close();
            }
        }
        self.context.shutdown();
    }

    async fn establish(self: &Arc<Self>) -> Result<Arc<Endpoint>, ClientError> {
        let stream = match connect_with_retry(&self.connector, self.config.retry).await {
            Ok(stream) => stream,
            Err(e) => match self.config.on_exhausted {
                ExhaustionPolicy::Exit { code } => {
                    tracing::error!("{}, exiting", e);
                    std::process::exit(code);
                }
                ExhaustionPolicy::ReturnError => return Err(e),
            },
        };

        let manager: Arc<dyn Manager> = self.clone();
        let endpoint = Endpoint::spawn(
            stream,
            self.connector.target(),
            manager,
            self.context.clone(),
        );
        self.endpoints_created.fetch_add(1, Ordering::SeqCst);
        *self.current.lock() = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn publish(&self, event: SessionEvent) {
        tracing::debug!("[{}] {}", event.endpoint().id(), event.kind());
        let _ = self.events.send(event);
    }

    fn start_client(endpoint: &Arc<Endpoint>, protocol: Arc<dyn Protocol>) -> bool {
        let name = protocol.name().to_string();
        match endpoint
            .handle_protocol(protocol.clone())
            .and_then(|_| protocol.start_as_client())
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[{}] Could not start {}: {}", endpoint.id(), name, e);
                endpoint.close();
                false
            }
        }
    }
}

impl<C: Connector> Manager for ClientManager<C> {
    fn endpoint_ready(&self, endpoint: &Arc<Endpoint>) {
        tracing::info!("[{}] Connected to {}", endpoint.id(), endpoint.remote());
        self.publish(SessionEvent::EndpointReady(endpoint.clone()));
        Self::start_client(endpoint, SessionProtocol::new(endpoint));
    }

    fn endpoint_closed(&self, endpoint: &Arc<Endpoint>) {
        {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| c.id() == endpoint.id()) {
                *current = None;
            }
        }
        self.publish(SessionEvent::EndpointClosed(endpoint.clone()));
    }

    fn session_started(&self, endpoint: &Arc<Endpoint>) {
        if Self::start_client(endpoint, KeepAliveProtocol::new(endpoint))
            && Self::start_client(endpoint, EventProtocol::new(endpoint))
        {
            self.publish(SessionEvent::SessionStarted(endpoint.clone()));
        }
    }

    fn session_stopped(&self, endpoint: &Arc<Endpoint>) {
        self.publish(SessionEvent::SessionStopped(endpoint.clone()));
        endpoint.close();
    }

    fn protocol_requested(&self, endpoint: &Arc<Endpoint>, protocol: Arc<dyn Protocol>) -> bool {
        let name = protocol.name().to_string();
        if name == SESSION_PROTOCOL || !endpoint.is_session_started() {
            tracing::warn!(
                "[{}] Server requested {} which is not allowed now",
                endpoint.id(),
                name
            );
            return false;
        }

        let accepted = endpoint.handle_protocol(protocol.clone()).is_ok()
            && protocol.start_as_server().is_ok();
        if accepted {
            self.publish(SessionEvent::ProtocolRequested {
                endpoint: endpoint.clone(),
                protocol: name,
            });
        }
        accepted
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Arc<Endpoint>) {
        tracing::warn!(
            "[{}] Disconnected abruptly from {}",
            endpoint.id(),
            endpoint.remote()
        );
        self.publish(SessionEvent::SessionError {
            endpoint: endpoint.clone(),
            reason: "disconnected".to_string(),
        });
    }

    fn endpoint_sent_invalid_message(&self, endpoint: &Arc<Endpoint>) {
        tracing::error!("[{}] Invalid message from {}", endpoint.id(), endpoint.remote());
        self.publish(SessionEvent::SessionError {
            endpoint: endpoint.clone(),
            reason: "invalid message".to_string(),
        });
        endpoint.close();
    }

    fn endpoint_timed_out(&self, endpoint: &Arc<Endpoint>, protocol: &str) {
        tracing::warn!(
            "[{}] {} timed out waiting for {}",
            endpoint.id(),
            protocol,
            endpoint.remote()
        );
        self.publish(SessionEvent::SessionError {
            endpoint: endpoint.clone(),
            reason: format!("{} timed out", protocol),
        });
        endpoint.close();
    }

    fn protocol_violation(&self, endpoint: &Arc<Endpoint>, protocol: &str) {
        tracing::error!(
            "[{}] Protocol violation in {} from {}",
            endpoint.id(),
            protocol,
            endpoint.remote()
        );
        self.publish(SessionEvent::SessionError {
            endpoint: endpoint.clone(),
            reason: format!("protocol violation in {}", protocol),
        });
        endpoint.close();
    }
}
