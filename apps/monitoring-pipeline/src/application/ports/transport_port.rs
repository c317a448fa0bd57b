//! Transport Port (Driven Port)
//!
//! Interface for the persistent push connection. Opening a link yields a
//! requester for request/acknowledgment round trips and an ordered stream of
//! inbound events.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::domain::events::PushEvent;

/// Connection credential. The token is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// Wrap a bearer token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// The raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("token", &"[REDACTED]").finish()
    }
}

/// Request sent over the push link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    /// Start live data for an equipment.
    Subscribe {
        /// Equipment id.
        equipment_id: String,
    },
    /// Stop live data for an equipment.
    Unsubscribe {
        /// Equipment id.
        equipment_id: String,
    },
    /// Application-level heartbeat.
    Ping,
}

impl OutboundRequest {
    /// Wire event name.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe:equipment",
            Self::Unsubscribe { .. } => "unsubscribe:equipment",
            Self::Ping => "ping",
        }
    }

    /// Wire payload.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Subscribe { equipment_id } | Self::Unsubscribe { equipment_id } => {
                json!({ "equipmentId": equipment_id })
            }
            Self::Ping => json!({}),
        }
    }
}

/// Acknowledgment of an [`OutboundRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestAck {
    /// Whether the server accepted the request.
    pub success: bool,
    /// Server message.
    pub message: Option<String>,
    /// Room joined, for subscriptions.
    pub room: Option<String>,
    /// Raw payload.
    pub data: Value,
}

impl RequestAck {
    /// Build an acknowledgment from its raw payload.
    #[must_use]
    pub fn from_payload(data: Value) -> Self {
        let success = data.get("success").and_then(Value::as_bool).unwrap_or(true);
        let message = data.get("message").and_then(Value::as_str).map(str::to_string);
        let room = data.get("room").and_then(Value::as_str).map(str::to_string);
        Self {
            success,
            message,
            room,
            data,
        }
    }

    /// A successful acknowledgment with an empty payload.
    #[must_use]
    pub fn ok() -> Self {
        Self::from_payload(json!({ "success": true }))
    }

    /// A refused acknowledgment.
    #[must_use]
    pub fn refused(message: impl Into<String>) -> Self {
        Self::from_payload(json!({ "success": false, "message": message.into() }))
    }
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server rejected the credential. Terminal.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The link could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The link closed before the request completed.
    #[error("connection closed")]
    Closed,

    /// No acknowledgment within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// No link is currently open.
    #[error("not connected")]
    NotConnected,

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the failure is an authentication failure (never retried).
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Inbound item on an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded server push.
    Push(PushEvent),
    /// The link closed. No further events follow.
    Closed {
        /// Why the link closed.
        reason: String,
    },
}

/// Sends requests over an open link.
#[async_trait]
pub trait RequestPort: Send + Sync {
    /// Send a request and wait for its acknowledgment.
    async fn request(&self, request: OutboundRequest) -> Result<RequestAck, TransportError>;

    /// Close the link. Outstanding requests fail with [`TransportError::Closed`].
    fn close(&self);
}

/// An open link.
pub struct TransportLink {
    /// Request side.
    pub requester: Arc<dyn RequestPort>,
    /// Inbound events, in the order the server sent them.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Port for opening push links.
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Open a new link.
    ///
    /// Returns once the server has accepted the connection.
    async fn open(&self, credential: &Credential) -> Result<TransportLink, TransportError>;
}
