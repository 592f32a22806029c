//! Administrative client: asks a server to shut down.

use crate::client::ClientManager;
use crate::connection::{ConnectionConfig, Connector};
use crate::error::ClientError;
use parking_lot::Mutex;
use pbnet_core::{CloseReason, SessionEvent};
use pbnet_protocol::{ShutdownMode, ERROR_EVENT};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinError;

/// Connects once, sends one shutdown request and ends the session.
#[derive(Debug, Clone)]
pub struct AdminClient {
    config: ConnectionConfig,
}

impl AdminClient {
    /// Reconnecting is always disabled for the admin client.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: config.with_reconnect(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Requests a server shutdown over TCP.
    pub async fn shutdown(&self, mode: ShutdownMode, secret: &str) -> Result<CloseReason, ClientError> {
        request_shutdown(ClientManager::tcp(self.config.clone()), mode, secret).await
    }
}

/// Runs `client`, waits for the session, emits the shutdown event for `mode`
/// with `secret`, then stops the session.
///
/// Returns [`ClientError::Rejected`] if the server answered with an error
/// event.
pub async fn request_shutdown<C: Connector>(
    client: Arc<ClientManager<C>>,
    mode: ShutdownMode,
    secret: &str,
) -> Result<CloseReason, ClientError> {
    let mut events = client.subscribe();
    let mut runner = tokio::spawn({
        let client = client.clone();
        async move { client.run().await }
    });

    let endpoint = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::SessionStarted(endpoint)) => break endpoint,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(ClientError::Task("event channel closed".to_string()))
                }
            },
            finished = &mut runner => {
                return Err(match joined(finished) {
                    Ok(reason) => ClientError::ConnectionClosed(reason),
                    Err(e) => e,
                });
            }
        }
    };

    let rejection = Arc::new(Mutex::new(None));
    {
        let rejection = rejection.clone();
        endpoint.on(ERROR_EVENT, move |_, args| {
            let message = args
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| args.to_string());
            *rejection.lock() = Some(message);
        });
    }

    tracing::info!("Requesting {} shutdown of {}", mode, endpoint.remote());
    endpoint.emit(mode.event_name(), &secret)?;
    endpoint.stop_session()?;

    let reason = joined(runner.await)?;
    let rejected = rejection.lock().take();
    match rejected {
        Some(message) => Err(ClientError::Rejected(message)),
        None => Ok(reason),
    }
}

fn joined(
    finished: Result<Result<CloseReason, ClientError>, JoinError>,
) -> Result<CloseReason, ClientError> {
    finished.map_err(|e| ClientError::Task(e.to_string()))?
}
