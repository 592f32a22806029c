//! Connection establishment: configuration, connectors and the retry loop.

use crate::error::ClientError;
use pbnet_core::ProtocolSettings;
use pbnet_protocol::{DEFAULT_HOST, DEFAULT_PORT};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Default number of connect attempts per cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default delay between failed connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default timeout of a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often and how fast to retry a failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// What to do once every connect attempt of a cycle has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Log and terminate the process with `code`.
    Exit { code: i32 },
    /// Return [`ClientError::RetriesExhausted`] to the caller.
    ReturnError,
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        ExhaustionPolicy::Exit { code: 1 }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Timeout of one connect attempt.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub on_exhausted: ExhaustionPolicy,
    /// Reconnect after an abrupt disconnect or timeout.
    pub reconnect: bool,
    /// Timings of the built-in protocols.
    pub settings: ProtocolSettings,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
            on_exhausted: ExhaustionPolicy::default(),
            reconnect: true,
            settings: ProtocolSettings::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy {
            max_attempts,
            delay,
        };
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_settings(mut self, settings: ProtocolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// `host:port`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

/// Opens streams to the server, one per connect attempt.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Where this connector connects to, for logs.
    fn target(&self) -> String;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let host = self.host.clone();
        let port = self.port;
        let connect_timeout = self.connect_timeout;
        async move {
            let stream =
                tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connects with up to `policy.max_attempts` attempts, sleeping
/// `policy.delay` between failed ones.
pub async fn connect_with_retry<C: Connector>(
    connector: &C,
    policy: RetryPolicy,
) -> Result<C::Stream, ClientError> {
    let target = connector.target();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        tracing::info!(
            "Connecting to {} (attempt {}/{})",
            target,
            attempt,
            max_attempts
        );

        match connector.connect().await {
            Ok(stream) => {
                tracing::info!("Connected to {}", target);
                return Ok(stream);
            }
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", target, e);
                if attempt >= max_attempts {
                    return Err(ClientError::RetriesExhausted {
                        attempts: attempt,
                        target,
                    });
                }
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
