//! Connection state and status snapshots.
//!
//! The connection manager is the only writer of these values; every other
//! component learns about transport health by observing [`ConnectionStatus`].

mod backoff;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use backoff::{BackoffConfig, BackoffPolicy};

/// State of the single push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and no connection attempt in progress.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and all active subscriptions replayed.
    Connected,
    /// Link lost; a retry is scheduled or in progress.
    Reconnecting,
    /// Terminal failure; only an explicit `connect` recovers.
    Error,
}

impl ConnectionState {
    /// Get the state as a string (for metrics labels and health output).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Numeric encoding for the connection state gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Error => 4.0,
        }
    }

    /// Whether a connection attempt is underway or established.
    ///
    /// `connect` is a no-op in these states.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason attached to the `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorReason {
    /// The server rejected the credential.
    AuthenticationFailed,
    /// The maximum number of reconnection attempts was reached.
    RetriesExhausted,
}

impl ConnectionErrorReason {
    /// Get the reason as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Snapshot published on every connection state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failed attempts (0 while connected).
    pub attempt: u32,
    /// Delay before the next retry, when one is scheduled.
    #[serde(with = "optional_millis")]
    pub next_retry: Option<Duration>,
    /// Reason for the `Error` state.
    pub reason: Option<ConnectionErrorReason>,
    /// Human-readable detail of the last failure.
    pub message: Option<String>,
    /// When the state was entered.
    pub changed_at: DateTime<Utc>,
}

impl ConnectionStatus {
    /// Initial status of a fresh manager.
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(ConnectionState::Disconnected)
    }

    /// Status with no attempt, retry or failure detail.
    #[must_use]
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            attempt: 0,
            next_retry: None,
            reason: None,
            message: None,
            changed_at: Utc::now(),
        }
    }

    /// Status for a scheduled retry after `attempt` consecutive failures.
    #[must_use]
    pub fn reconnecting(attempt: u32, next_retry: Duration, message: impl Into<String>) -> Self {
        Self {
            attempt,
            next_retry: Some(next_retry),
            message: Some(message.into()),
            ..Self::new(ConnectionState::Reconnecting)
        }
    }

    /// Terminal error status.
    #[must_use]
    pub fn error(reason: ConnectionErrorReason, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            attempt,
            reason: Some(reason),
            message: Some(message.into()),
            ..Self::new(ConnectionState::Error)
        }
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(delay) => serializer.serialize_some(&u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }
}
