//! # pbnet-client
//!
//! Client role for pbnet.
//!
//! This crate provides:
//! - Connect with a fixed-delay retry policy
//! - Session, keepalive and event bootstrap on every new endpoint
//! - Automatic reconnection after an abrupt disconnect or timeout
//! - The administrative shutdown client

pub mod admin;
pub mod client;
pub mod connection;
pub mod error;

pub use admin::{request_shutdown, AdminClient};
pub use client::ClientManager;
pub use connection::{
    connect_with_retry, ConnectionConfig, Connector, ExhaustionPolicy, RetryPolicy, TcpConnector,
};
pub use error::ClientError;
