//! Server role: accepts sessions and handles admin shutdown requests.

use crate::auth::SecretValidator;
use dashmap::DashMap;
use pbnet_core::{
    Endpoint, EventProtocol, KeepAliveProtocol, Manager, Protocol, SessionEvent, TimerHandle,
};
use pbnet_protocol::{ShutdownMode, ERROR_EVENT, SESSION_PROTOCOL};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};

/// Default capacity for the session event channel.
const SESSION_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Accepting side of every connection the server hosts.
///
/// Permits `SessionProtocol` only before the session has started and every
/// other registered protocol only after. Live endpoints are tracked by id.
///
/// A connection that does not start a session within the handshake timeout
/// is closed. Once started, the server watches keepalive on every session
/// whether or not the client asks for it.
pub struct ServerManager {
    this: Weak<ServerManager>,
    secrets: SecretValidator,
    endpoints: DashMap<String, Arc<Endpoint>>,
    /// Pending session deadlines by endpoint id.
    handshakes: DashMap<String, TimerHandle>,
    /// Number of live endpoints.
    active: watch::Sender<usize>,
    shutdown: watch::Sender<Option<ShutdownMode>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ServerManager {
    pub fn new(secrets: SecretValidator) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            secrets,
            endpoints: DashMap::new(),
            handshakes: DashMap::new(),
            active: watch::channel(0).0,
            shutdown: watch::channel(None).0,
            events,
        })
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(id).map(|entry| entry.value().clone())
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Watches the number of live endpoints.
    pub fn watch_endpoints(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }

    /// The shutdown requested so far, if any.
    pub fn shutdown_mode(&self) -> Option<ShutdownMode> {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<Option<ShutdownMode>> {
        self.shutdown.subscribe()
    }

    /// Resolves once no endpoint is left.
    pub async fn wait_drained(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Starts tracking a freshly spawned endpoint.
    pub(crate) fn track(&self, endpoint: &Arc<Endpoint>) {
        self.endpoints
            .insert(endpoint.id().to_string(), endpoint.clone());
        // endpoint_closed may already have run.
        if endpoint.is_closed() {
            self.endpoints.remove(endpoint.id());
        }
        self.refresh_count();
    }

    /// Records a shutdown and applies it to every endpoint except
    /// `requester`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn request_shutdown(&self, mode: ShutdownMode, requester: Option<&str>) {
        tracing::info!("Server {} shutdown requested", mode);
        self.shutdown.send_replace(Some(mode));

        let others: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != requester)
            .map(|entry| entry.value().clone())
            .collect();

        // Other endpoints are handled off the requester's decode task.
        match mode {
            ShutdownMode::Graceful => {}
            ShutdownMode::Force => {
                tokio::spawn(async move {
                    for endpoint in others {
                        tracing::info!("[{}] Stopping session", endpoint.id());
                        if endpoint.stop_session().is_err() {
                            endpoint.close();
                        }
                    }
                });
            }
            ShutdownMode::Vader => {
                tokio::spawn(async move {
                    for endpoint in others {
                        tracing::info!("[{}] Dropping connection", endpoint.id());
                        endpoint.close();
                    }
                });
            }
        }
    }

    fn handle_shutdown_event(&self, endpoint: &Arc<Endpoint>, mode: ShutdownMode, args: &Value) {
        let secret = args.as_str().unwrap_or_default();
        if !self.secrets.validate(secret) {
            let reason = if self.secrets.is_enabled() {
                "invalid secret"
            } else {
                "admin shutdown is disabled"
            };
            tracing::warn!(
                "[{}] Rejected {} shutdown from {}: {}",
                endpoint.id(),
                mode,
                endpoint.remote(),
                reason
            );
            if let Err(e) = endpoint.emit(ERROR_EVENT, &reason) {
                tracing::warn!("[{}] Could not send error event: {}", endpoint.id(), e);
            }
            return;
        }

        tracing::info!(
            "[{}] Accepted {} shutdown from {}",
            endpoint.id(),
            mode,
            endpoint.remote()
        );
        self.request_shutdown(mode, Some(endpoint.id()));
    }

    /// Closes `endpoint` unless its session starts within the handshake
    /// timeout.
    fn arm_handshake_deadline(&self, endpoint: &Arc<Endpoint>) {
        let timeout = endpoint.settings().handshake_timeout;
        let weak = Arc::downgrade(endpoint);
        let deadline = endpoint.timers().after(timeout, move || {
            let Some(endpoint) = weak.upgrade() else {
                return;
            };
            if endpoint.is_session_started() {
                return;
            }
            tracing::warn!(
                "[{}] No session from {} within {:?}",
                endpoint.id(),
                endpoint.remote(),
                timeout
            );
            endpoint.report_timeout(SESSION_PROTOCOL);
        });
        self.handshakes.insert(endpoint.id().to_string(), deadline);
        // endpoint_closed may already have run.
        if endpoint.is_closing() {
            self.handshakes.remove(endpoint.id());
        }
    }

    fn register_admin_handlers(&self, endpoint: &Arc<Endpoint>) {
        for mode in ShutdownMode::ALL {
            let manager = self.this.clone();
            endpoint.on(mode.event_name(), move |endpoint, args| {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_shutdown_event(endpoint, mode, args);
                }
            });
        }
    }

    fn refresh_count(&self) {
        self.active
            .send_modify(|count| *count = self.endpoints.len());
    }

    fn publish(&self, event: SessionEvent) {
        tracing::debug!("[{}] {}", event.endpoint().id(), event.kind());
        let _ = self.events.send(event);
    }
}

impl Manager for ServerManager {
    fn endpoint_ready(&self, endpoint: &Arc<Endpoint>) {
        tracing::info!("[{}] Accepted {}", endpoint.id(), endpoint.remote());
        self.arm_handshake_deadline(endpoint);
        self.publish(SessionEvent::EndpointReady(endpoint.clone()));
    }

    fn endpoint_closed(&self, endpoint: &Arc<Endpoint>) {
        self.endpoints.remove(endpoint.id());
        self.handshakes.remove(endpoint.id());
        self.refresh_count();
        tracing::info!("[{}] Client disconnected: {}", endpoint.id(), endpoint.remote());
        self.publish(SessionEvent::EndpointClosed(endpoint.clone()));
    }

    fn session_started(&self, endpoint: &Arc<Endpoint>) {
        self.handshakes.remove(endpoint.id());

        let events = EventProtocol::new(endpoint);
        let keepalive = KeepAliveProtocol::new(endpoint);
        let started = endpoint
            .handle_protocol(events.clone())
            .and_then(|_| events.start_as_server())
            .and_then(|_| endpoint.handle_protocol(keepalive.clone()))
            .and_then(|_| keepalive.start_as_server());
        if let Err(e) = started {
            tracing::error!("[{}] Could not start session protocols: {}", endpoint.id(), e);
            endpoint.close();
            return;
        }

        self.register_admin_handlers(endpoint);
        self.publish(SessionEvent::SessionStarted(endpoint.clone()));
    }

    fn session_stopped(&self, endpoint: &Arc<Endpoint>) {
        self.publish(SessionEvent::SessionStopped(endpoint.clone()));
        endpoint.close();
    }

    fn protocol_requested(&self, endpoint: &Arc<Endpoint>, protocol: Arc<dyn Protocol>) -> bool {
        let name = protocol.name().to_string();
        let is_session = name == SESSION_PROTOCOL;
        if is_session == endpoint.is_session_started() {
            tracing::warn!(
                "[{}] Client requested {} which is not allowed now",
                endpoint.id(),
                name
            );
            return false;
        }

        let accepted = endpoint.handle_protocol(protocol.clone()).is_ok()
            && protocol.start_as_server().is_ok();
        if accepted {
            tracing::debug!("[{}] Started {} as server", endpoint.id(), name);
            self.publish(SessionEvent::ProtocolRequested {
                endpoint: endpoint.clone(),
                protocol: name,
            });
        }
        accepted
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Arc<Endpoint>) {
        tracing::warn!(
            "[{}] {} disconnected abruptly",
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
