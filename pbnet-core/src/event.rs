//! One-way named application events.

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::protocol::{Protocol, ProtocolLink, RequestReply};
use pbnet_protocol::{EventBody, Message, EVENT_PROTOCOL};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

/// Carries application events. Both sides emit requests; there are no
/// replies.
pub struct EventProtocol {
    link: ProtocolLink,
}

impl EventProtocol {
    pub fn new(endpoint: &Arc<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            link: ProtocolLink::new(EVENT_PROTOCOL, endpoint),
        })
    }

    pub fn emit(&self, event: &str, args: Value) -> Result<(), EndpointError> {
        self.link.ensure_running()?;
        let body = EventBody {
            event: event.to_string(),
            args,
        };
        self.send_request(serde_json::to_value(body)?)
    }
}

impl Protocol for EventProtocol {
    fn link(&self) -> &ProtocolLink {
        &self.link
    }

    fn start_as_client(&self) -> Result<(), EndpointError> {
        self.link.begin()?;
        Ok(())
    }

    fn start_as_server(&self) -> Result<(), EndpointError> {
        self.link.begin()?;
        Ok(())
    }

    fn stop(&self) {
        self.link.finish();
    }

    fn as_request_reply(&self) -> Option<&dyn RequestReply> {
        Some(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl RequestReply for EventProtocol {
    fn receive_request(&self, message: Message) -> Result<(), EndpointError> {
        let body: EventBody = message.parse_body()?;
        let endpoint = self.link.endpoint()?;
        tracing::debug!("[{}] Event {}", endpoint.id(), body.event);
        endpoint.fire(&body.event, &body.args);
        Ok(())
    }

    fn receive_reply(&self, _message: Message) -> Result<(), EndpointError> {
        Err(EndpointError::violation(EVENT_PROTOCOL, "events are one-way"))
    }
}
