//! pbnet - session server
//!
//! Hosts session-oriented endpoints with keepalive and admin shutdown.

use pbnet_protocol::ShutdownMode;
use pbnet_server::{Config, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Defaults, then PBNET_CONFIG, then environment overrides.
    let config = match Config::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var("PBNET_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting pbnet server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Keepalive: {}s, handshake timeout: {}s",
        config.protocol.keepalive_secs,
        config.protocol.handshake_timeout_secs
    );
    let secrets = config.admin.validator();
    if secrets.is_enabled() {
        tracing::info!(
            "  Admin shutdown: enabled ({} secret(s))",
            secrets.secret_count()
        );
    } else {
        tracing::info!("  Admin shutdown: disabled");
    }

    let server = Arc::new(Server::from_config(&config));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping sessions...");
        shutdown_server.shutdown(ShutdownMode::Force);

        tokio::signal::ctrl_c().await.ok();
        tracing::warn!("Second shutdown signal, dropping connections");
        shutdown_server.shutdown(ShutdownMode::Vader);
    });

    server.run().await?;
    Ok(())
}
