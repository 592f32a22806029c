//! Process-wide context shared by endpoints.

use crate::protocol::ProtocolRegistry;
use crate::timer::Timers;
use std::sync::Arc;
use std::time::Duration;

/// Default keepalive period.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Default time a session requester waits for the start reply.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Timings of the built-in protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub keepalive_period: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Everything an endpoint needs besides its stream and manager.
///
/// Built once by the owner (client or server) and cloned into each endpoint.
#[derive(Debug, Clone)]
pub struct EndpointContext {
    pub timers: Timers,
    pub registry: Arc<ProtocolRegistry>,
    pub settings: ProtocolSettings,
}

impl EndpointContext {
    pub fn new() -> Self {
        Self {
            timers: Timers::new(),
            registry: Arc::new(ProtocolRegistry::new()),
            settings: ProtocolSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProtocolSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Cancels every timer created through this context.
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}

impl Default for EndpointContext {
    fn default() -> Self {
        Self::new()
    }
}
