//! TCP server implementation.

use crate::auth::SecretValidator;
use crate::config::Config;
use crate::error::ServerError;
use crate::manager::ServerManager;
use pbnet_core::{Endpoint, EndpointContext, Manager, ProtocolSettings, SessionEvent};
use pbnet_protocol::{ShutdownMode, DEFAULT_PORT};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent endpoints.
    pub max_connections: usize,
    /// Timings of the built-in protocols.
    pub settings: ProtocolSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: 1000,
            settings: ProtocolSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_settings(mut self, settings: ProtocolSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            settings: config.protocol.settings(),
        }
    }
}

/// Hosts one endpoint per accepted connection, all sharing one
/// [`ServerManager`].
pub struct Server {
    config: ServerConfig,
    manager: Arc<ServerManager>,
    context: EndpointContext,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, secrets: SecretValidator) -> Self {
        let context = EndpointContext::new().with_settings(config.settings);
        Self {
            config,
            manager: ServerManager::new(secrets),
            context,
            running: AtomicBool::new(false),
        }
    }

    /// Builds a server from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(ServerConfig::from(config), config.admin.validator())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.manager
    }

    pub fn context(&self) -> &EndpointContext {
        &self.context
    }

    /// Subscribes to session lifecycle events of every endpoint.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.manager.subscribe()
    }

    /// Binds `config.bind_addr` and runs until a shutdown was requested and
    /// every endpoint is gone.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Like [`Server::run`] on an already bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        tracing::info!("Server listening on {}", listener.local_addr()?);
        self.running.store(true, Ordering::SeqCst);

        let mut shutdown = self.manager.shutdown_signal();
        loop {
            let requested = *shutdown.borrow_and_update();
            if let Some(mode) = requested {
                tracing::info!("Server no longer accepting connections ({} shutdown)", mode);
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            tcp_stream.set_nodelay(true).ok();
                            if let Err(e) = self.serve_stream(tcp_stream, addr.to_string()) {
                                tracing::warn!("Rejecting {}: {}", addr, e);
                            }
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        drop(listener);

        let remaining = self.manager.endpoint_count();
        if remaining > 0 {
            tracing::info!("Waiting for {} endpoint(s) to close", remaining);
        }
        self.manager.wait_drained().await;
        self.context.shutdown();
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Hosts a connected stream as a new endpoint.
    ///
    /// Fails once a shutdown was requested or `max_connections` endpoints are
    /// live; the stream is dropped in that case.
    pub fn serve_stream<S>(
        &self,
        stream: S,
        remote: impl Into<String>,
    ) -> Result<Arc<Endpoint>, ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.manager.shutdown_mode().is_some() {
            return Err(ServerError::ShuttingDown);
        }
        if self.manager.endpoint_count() >= self.config.max_connections {
            return Err(ServerError::ConnectionLimit(self.config.max_connections));
        }

        let manager: Arc<dyn Manager> = self.manager.clone();
        let endpoint = Endpoint::spawn(stream, remote, manager, self.context.clone());
        self.manager.track(&endpoint);
        Ok(endpoint)
    }

    /// Requests a shutdown as if an authorised admin had asked for it.
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.manager.request_shutdown(mode, None);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbnet_client::{
        request_shutdown, ClientError, ClientManager, ConnectionConfig, Connector,
        ExhaustionPolicy,
    };
    use pbnet_core::CloseReason;
    use pbnet_protocol::{
        Encoder, Message, MessageKind, SessionBody, EVENT_PROTOCOL, KEEPALIVE_PROTOCOL,
        SESSION_PROTOCOL,
    };
    use std::future::Future;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;
    use tokio::sync::broadcast::error::RecvError;

    const SECRET: &str = "whiteboard-admin";

    /// Hands each connect attempt straight to `serve_stream`.
    struct Direct {
        server: Arc<Server>,
    }

    impl Connector for Direct {
        type Stream = DuplexStream;

        fn connect(&self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let result = self
                .server
                .serve_stream(server, "memory")
                .map(|_| client)
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()));
            async move { result }
        }

        fn target(&self) -> String {
            "memory:3100".to_string()
        }
    }

    fn server(secrets: SecretValidator) -> Arc<Server> {
        Arc::new(Server::new(
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            secrets,
        ))
    }

    /// Handshake well below the keepalive period so the two deadlines can be
    /// told apart.
    fn short_handshake_server() -> Arc<Server> {
        let settings = ProtocolSettings {
            keepalive_period: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
        };
        Arc::new(Server::new(
            ServerConfig::default().with_settings(settings),
            SecretValidator::default(),
        ))
    }

    fn client_config(port: u16) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", port)
            .with_retry(1, Duration::from_millis(1))
            .with_exhaustion_policy(ExhaustionPolicy::ReturnError)
            .with_reconnect(false)
    }

    fn direct_client(server: &Arc<Server>) -> Arc<ClientManager<Direct>> {
        ClientManager::new(
            Direct {
                server: server.clone(),
            },
            client_config(DEFAULT_PORT),
        )
    }

    async fn next(events: &mut broadcast::Receiver<SessionEvent>, kind: &str) -> Arc<Endpoint> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind() == kind => return event.endpoint().clone(),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for event")
    }

    async fn endpoints_drop_to(server: &Server, count: usize) {
        let mut active = server.manager().watch_endpoints();
        tokio::time::timeout(Duration::from_secs(10), active.wait_for(|n| *n == count))
            .await
            .expect("timed out waiting for endpoints")
            .unwrap();
    }

    /// Starts `server` on an ephemeral port; returns the port and the run task.
    async fn listen(
        server: &Arc<Server>,
    ) -> (u16, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.run_with_listener(listener).await }
        });
        (port, task)
    }

    fn spawn_run<C: Connector>(
        client: &Arc<ClientManager<C>>,
    ) -> tokio::task::JoinHandle<Result<CloseReason, ClientError>> {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    }

    #[test]
    fn test_server_config_from_config() {
        let mut config = Config::default();
        config.network.max_connections = 5;
        config.protocol.keepalive_secs = 7;

        let server_config = ServerConfig::from(&config);
        assert_eq!(server_config.bind_addr.port(), 3100);
        assert_eq!(server_config.max_connections, 5);
        assert_eq!(
            server_config.settings.keepalive_period,
            Duration::from_secs(7)
        );
    }

    #[tokio::test]
    async fn test_session_over_tcp() {
        let server = server(SecretValidator::default());
        let mut server_events = server.subscribe();
        let (port, task) = listen(&server).await;

        let client = ClientManager::tcp(client_config(port));
        let mut events = client.subscribe();
        let runner = spawn_run(&client);

        let endpoint = next(&mut events, "session_started").await;
        let hosted = next(&mut server_events, "session_started").await;
        assert_eq!(endpoint.peer_id(), Some(hosted.id().to_string()));
        assert_eq!(hosted.peer_id(), Some(endpoint.id().to_string()));
        assert!(hosted.protocol(SESSION_PROTOCOL).unwrap().is_running());
        assert!(hosted.protocol(EVENT_PROTOCOL).unwrap().is_running());
        assert_eq!(server.manager().endpoint_count(), 1);
        assert!(server.is_running());

        client.shutdown();
        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::SessionStopped);
        endpoints_drop_to(&server, 0).await;

        server.shutdown(ShutdownMode::Graceful);
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_runs_from_session_start() {
        let server = server(SecretValidator::default());
        let mut server_events = server.subscribe();
        let client = direct_client(&server);
        let runner = spawn_run(&client);

        let hosted = next(&mut server_events, "session_started").await;
        assert!(hosted.protocol(KEEPALIVE_PROTOCOL).unwrap().is_running());

        // The client's pings reach the instance the server started itself.
        tokio::time::sleep(server.config().settings.keepalive_period * 5).await;
        assert!(!hosted.is_closing());
        assert!(hosted.protocol(KEEPALIVE_PROTOCOL).unwrap().is_running());

        client.shutdown();
        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::SessionStopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_times_out() {
        let server = short_handshake_server();
        let (_peer, stream) = tokio::io::duplex(1024);
        let started = Instant::now();
        let hosted = server.serve_stream(stream, "silent").unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(60), hosted.wait_closed())
            .await
            .unwrap();

        assert_eq!(reason, CloseReason::TimedOut);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5), "closed after {:?}", waited);
        assert!(waited < Duration::from_secs(30), "closed after {:?}", waited);
        endpoints_drop_to(&server, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_without_keepalive_times_out() {
        let server = short_handshake_server();
        let mut server_events = server.subscribe();
        let (mut peer, stream) = tokio::io::duplex(64 * 1024);
        let started = Instant::now();
        let hosted = server.serve_stream(stream, "quiet").unwrap();

        let start = Message::with_body(
            SESSION_PROTOCOL,
            MessageKind::Request,
            &SessionBody::Start {
                endpoint_id: "quiet-peer".into(),
            },
        )
        .unwrap();
        peer.write_all(&Encoder::encode_message(&start).unwrap())
            .await
            .unwrap();
        next(&mut server_events, "session_started").await;
        assert_eq!(hosted.peer_id(), Some("quiet-peer".to_string()));

        let reason = tokio::time::timeout(Duration::from_secs(120), hosted.wait_closed())
            .await
            .unwrap();

        assert_eq!(reason, CloseReason::TimedOut);
        // The handshake deadline was cancelled; keepalive closed it.
        assert!(started.elapsed() >= Duration::from_secs(30));
        endpoints_drop_to(&server, 0).await;
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let server = server(SecretValidator::from_secret(SECRET));

        let result = request_shutdown(direct_client(&server), ShutdownMode::Force, "guess").await;

        assert!(matches!(result, Err(ClientError::Rejected(ref m)) if m == "invalid secret"));
        assert_eq!(server.manager().shutdown_mode(), None);
        endpoints_drop_to(&server, 0).await;
        assert!(server.serve_stream(tokio::io::duplex(64).1, "late").is_ok());
    }

    #[tokio::test]
    async fn test_admin_disabled_without_secret() {
        let server = server(SecretValidator::default());

        let result = request_shutdown(direct_client(&server), ShutdownMode::Graceful, "").await;

        assert!(matches!(result, Err(ClientError::Rejected(_))));
        assert_eq!(server.manager().shutdown_mode(), None);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_sessions() {
        let server = server(SecretValidator::from_secret(SECRET));
        let (port, task) = listen(&server).await;

        let regular = ClientManager::tcp(client_config(port));
        let mut events = regular.subscribe();
        let regular_run = spawn_run(&regular);
        next(&mut events, "session_started").await;

        let admin = ClientManager::tcp(client_config(port));
        let reason = request_shutdown(admin, ShutdownMode::Graceful, SECRET)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::SessionStopped);
        assert_eq!(server.manager().shutdown_mode(), Some(ShutdownMode::Graceful));

        // The regular session is untouched and keeps the server alive.
        endpoints_drop_to(&server, 1).await;
        assert!(!task.is_finished());
        assert!(matches!(
            server.serve_stream(tokio::io::duplex(64).1, "late"),
            Err(ServerError::ShuttingDown)
        ));

        regular.shutdown();
        assert_eq!(
            regular_run.await.unwrap().unwrap(),
            CloseReason::SessionStopped
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_force_shutdown_tears_down_sessions() {
        let server = server(SecretValidator::from_secret(SECRET));
        let (port, task) = listen(&server).await;

        let mut runs = Vec::new();
        for _ in 0..2 {
            let client = ClientManager::tcp(client_config(port));
            let mut events = client.subscribe();
            runs.push(spawn_run(&client));
            next(&mut events, "session_started").await;
        }

        let admin = ClientManager::tcp(client_config(port));
        let reason = request_shutdown(admin, ShutdownMode::Force, SECRET)
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::SessionStopped);

        for run in runs {
            assert_eq!(run.await.unwrap().unwrap(), CloseReason::SessionStopped);
        }
        task.await.unwrap().unwrap();
        assert_eq!(server.manager().endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_vader_shutdown_drops_connections() {
        let server = server(SecretValidator::from_secret(SECRET));
        let (port, task) = listen(&server).await;

        let regular = ClientManager::tcp(client_config(port));
        let mut events = regular.subscribe();
        let regular_run = spawn_run(&regular);
        next(&mut events, "session_started").await;

        let admin = ClientManager::tcp(client_config(port));
        let reason = request_shutdown(admin, ShutdownMode::Vader, SECRET)
            .await
            .unwrap();
        // The requester ends its own session normally.
        assert_eq!(reason, CloseReason::SessionStopped);

        assert_eq!(
            regular_run.await.unwrap().unwrap(),
            CloseReason::Disconnected
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = Arc::new(Server::new(
            ServerConfig::default().with_max_connections(1),
            SecretValidator::default(),
        ));

        let (_peer, stream) = tokio::io::duplex(64);
        let first = server.serve_stream(stream, "first").unwrap();
        let (_other_peer, stream) = tokio::io::duplex(64);
        assert!(matches!(
            server.serve_stream(stream, "second"),
            Err(ServerError::ConnectionLimit(1))
        ));

        first.close();
        endpoints_drop_to(&server, 0).await;
        assert!(server.serve_stream(tokio::io::duplex(64).1, "third").is_ok());
    }
}
