//! Protocol-addressed messages and the bodies of the built-in protocols.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of the session handshake protocol.
pub const SESSION_PROTOCOL: &str = "SessionProtocol";

/// Name of the heartbeat protocol.
pub const KEEPALIVE_PROTOCOL: &str = "KeepAliveProtocol";

/// Name of the application event protocol.
pub const EVENT_PROTOCOL: &str = "EventProtocol";

/// Whether a message opens an exchange or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Request,
    Reply,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Reply => write!(f, "REPLY"),
        }
    }
}

/// One framed unit of data addressed to a named protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key: the name of the protocol this message belongs to.
    pub protocol: String,

    pub kind: MessageKind,

    /// Protocol-specific body.
    #[serde(default)]
    pub body: Value,
}

impl Message {
    pub fn request(protocol: impl Into<String>, body: Value) -> Self {
        Self {
            protocol: protocol.into(),
            kind: MessageKind::Request,
            body,
        }
    }

    pub fn reply(protocol: impl Into<String>, body: Value) -> Self {
        Self {
            protocol: protocol.into(),
            kind: MessageKind::Reply,
            body,
        }
    }

    /// Builds a message with a typed body.
    pub fn with_body<T: Serialize>(
        protocol: impl Into<String>,
        kind: MessageKind,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            protocol: protocol.into(),
            kind,
            body: serde_json::to_value(body)?,
        })
    }

    /// Parses the body as `T`.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// Session handshake bodies. The same shape is used for request and reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionBody {
    /// Open a session; carries the sender's endpoint id.
    Start { endpoint_id: String },
    /// Tear the session down.
    Stop,
}

/// Keepalive bodies carry nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveBody {}

/// A named application event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub event: String,
    #[serde(default)]
    pub args: Value,
}

/// The three administrative shutdown requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Stop accepting connections and let sessions end on their own.
    Graceful,
    /// Stop accepting connections and tear down every session.
    Force,
    /// Drop every connection immediately.
    Vader,
}

impl ShutdownMode {
    pub const ALL: [ShutdownMode; 3] = [
        ShutdownMode::Graceful,
        ShutdownMode::Force,
        ShutdownMode::Vader,
    ];

    /// Event name the admin client emits for this mode.
    pub fn event_name(&self) -> &'static str {
        match self {
            ShutdownMode::Graceful => "SERVER_SHUTDOWN",
            ShutdownMode::Force => "SERVER_FORCE_SHUTDOWN",
            ShutdownMode::Vader => "SERVER_VADER_SHUTDOWN",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.event_name() == name)
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownMode::Graceful => write!(f, "graceful"),
            ShutdownMode::Force => write!(f, "force"),
            ShutdownMode::Vader => write!(f, "vader"),
        }
    }
}

/// Event the server emits back when a request carried bad arguments.
pub const ERROR_EVENT: &str = "ERROR";
