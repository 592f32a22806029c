//! # pbnet-server
//!
//! Server role for pbnet.
//!
//! This crate provides:
//! - TCP accept loop with a connection limit
//! - Session hosting through a shared `ServerManager`
//! - Admin shutdown (graceful, force, vader) guarded by SHA-256 secrets
//! - YAML and environment configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod manager;
pub mod server;

pub use auth::SecretValidator;
pub use config::{AdminConfig, Config, ConfigError, NetworkConfig, ProtocolConfig};
pub use error::ServerError;
pub use manager::ServerManager;
pub use server::{Server, ServerConfig};
