//! Heartbeat protocol.
//!
//! The client sends a request immediately and then once per period, as long
//! as the previous period saw a sign of life. The server only watches: every
//! request is answered and counts as life, and a period without one is a
//! timeout. A timed-out protocol reports to its endpoint once and stops.

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::protocol::{Protocol, ProtocolLink, RequestReply};
use crate::timer::{Tick, TimerHandle};
use parking_lot::Mutex;
use pbnet_protocol::{KeepAliveBody, Message, KEEPALIVE_PROTOCOL};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub struct KeepAliveProtocol {
    link: ProtocolLink,
    this: Weak<Self>,
    period: Duration,
    alive: AtomicBool,
    client: AtomicBool,
    timer: Mutex<Option<TimerHandle>>,
}

impl KeepAliveProtocol {
    /// Builds the protocol with the endpoint's configured period.
    pub fn new(endpoint: &Arc<Endpoint>) -> Arc<Self> {
        Self::with_period(endpoint, endpoint.settings().keepalive_period)
    }

    pub fn with_period(endpoint: &Arc<Endpoint>, period: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            link: ProtocolLink::new(KEEPALIVE_PROTOCOL, endpoint),
            this: this.clone(),
            period,
            alive: AtomicBool::new(false),
            client: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn ping(&self) -> Result<(), EndpointError> {
        self.send_request(serde_json::to_value(KeepAliveBody::default())?)
    }

    fn arm(&self, endpoint: &Arc<Endpoint>) {
        let this = self.this.clone();
        let timer = endpoint.timers().every(self.period, move || match this.upgrade() {
            Some(keepalive) => keepalive.on_tick(),
            None => Tick::Stop,
        });
        *self.timer.lock() = Some(timer);
    }

    fn on_tick(&self) -> Tick {
        if !self.is_running() {
            return Tick::Stop;
        }
        if self.alive.swap(false, Ordering::SeqCst) {
            if self.client.load(Ordering::SeqCst) && self.ping().is_err() {
                return Tick::Stop;
            }
            return Tick::Continue;
        }

        if let Ok(endpoint) = self.link.endpoint() {
            tracing::warn!(
                "[{}] No keepalive from {} within {:?}",
                endpoint.id(),
                endpoint.remote(),
                self.period
            );
            self.stop();
            endpoint.report_timeout(KEEPALIVE_PROTOCOL);
        }
        Tick::Stop
    }
}

impl Protocol for KeepAliveProtocol {
    fn link(&self) -> &ProtocolLink {
        &self.link
    }

    fn start_as_client(&self) -> Result<(), EndpointError> {
        let endpoint = self.link.begin()?;
        self.client.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.ping()?;
        self.arm(&endpoint);
        Ok(())
    }

    fn start_as_server(&self) -> Result<(), EndpointError> {
        let endpoint = self.link.begin()?;
        self.arm(&endpoint);
        Ok(())
    }

    fn stop(&self) {
        self.link.finish();
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn as_request_reply(&self) -> Option<&dyn RequestReply> {
        Some(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl RequestReply for KeepAliveProtocol {
    fn receive_request(&self, _message: Message) -> Result<(), EndpointError> {
        self.send_reply(serde_json::to_value(KeepAliveBody::default())?)?;
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn receive_reply(&self, _message: Message) -> Result<(), EndpointError> {
        if !self.client.load(Ordering::SeqCst) {
            return Err(EndpointError::violation(
                KEEPALIVE_PROTOCOL,
                "reply without a request",
            ));
        }
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }
}
