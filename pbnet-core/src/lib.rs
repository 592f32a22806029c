//! # pbnet-core
//!
//! Connection core for pbnet.
//!
//! This crate provides:
//! - Endpoints that own one connection and multiplex named protocols over it
//! - The manager contract through which endpoints report to their role
//! - The session handshake, keepalive heartbeat and event protocols
//! - A cancellable timer facility

pub mod context;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod timer;

#[cfg(test)]
mod testing;

pub use context::{EndpointContext, ProtocolSettings};
pub use endpoint::{CloseReason, Endpoint, EventHandler};
pub use error::EndpointError;
pub use event::EventProtocol;
pub use keepalive::KeepAliveProtocol;
pub use manager::{Manager, SessionEvent};
pub use protocol::{
    Protocol, ProtocolFactory, ProtocolLink, ProtocolRegistry, ProtocolState, RequestReply,
};
pub use session::{SessionProtocol, SessionState};
pub use timer::{Tick, TimerHandle, Timers};
