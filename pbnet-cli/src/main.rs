//! pbnet-admin - administrative client for pbnet servers
//!
//! Connects once, asks the server to shut down and ends the session.

use clap::{ArgGroup, Parser};
use colored::Colorize;
use pbnet_client::connection::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
use pbnet_client::{AdminClient, ClientError, ConnectionConfig, ExhaustionPolicy};
use pbnet_protocol::{ShutdownMode, DEFAULT_HOST, DEFAULT_PORT};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pbnet-admin")]
#[command(about = "Administrative client for pbnet servers")]
#[command(version)]
#[command(group(ArgGroup::new("action").required(true).args(["shutdown", "hash_secret"])))]
struct Cli {
    /// Server host
    #[arg(long, default_value = DEFAULT_HOST, env = "PBNET_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PBNET_PORT")]
    port: u16,

    /// Admin password
    #[arg(long, default_value = "", env = "PBNET_ADMIN_PASSWORD", hide_env_values = true)]
    password: String,

    /// Stop accepting connections and let sessions end on their own
    #[arg(long)]
    shutdown: bool,

    /// With --shutdown: tear down every session
    #[arg(long, requires = "shutdown", conflicts_with = "vader")]
    force: bool,

    /// With --shutdown: drop every connection immediately
    #[arg(long, requires = "shutdown")]
    vader: bool,

    /// Connect attempts before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    retries: u32,

    /// Print the SHA-256 hash of a secret for the server config and exit
    #[arg(long, value_name = "SECRET")]
    hash_secret: Option<String>,
}

impl Cli {
    fn mode(&self) -> Option<ShutdownMode> {
        if !self.shutdown {
            return None;
        }
        Some(if self.force {
            ShutdownMode::Force
        } else if self.vader {
            ShutdownMode::Vader
        } else {
            ShutdownMode::Graceful
        })
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.host.clone(), self.port)
            .with_retry(self.retries, DEFAULT_RETRY_DELAY)
            .with_exhaustion_policy(ExhaustionPolicy::ReturnError)
    }
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(secret) = &cli.hash_secret {
        println!("{}", hash_secret(secret));
        return Ok(());
    }

    let Some(mode) = cli.mode() else {
        return Err("nothing to do".into());
    };

    let admin = AdminClient::new(cli.connection_config());
    let target = admin.config().target();
    match admin.shutdown(mode, &cli.password).await {
        Ok(reason) => {
            println!(
                "{} {} shutdown requested from {} ({})",
                "OK".green(),
                mode,
                target.cyan(),
                reason
            );
            Ok(())
        }
        Err(ClientError::Rejected(message)) => {
            eprintln!("{}: {}", "Rejected".red(), message);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
