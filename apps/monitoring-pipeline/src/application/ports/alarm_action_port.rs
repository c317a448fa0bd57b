//! Alarm Action Port (Driven Port)
//!
//! Interface for applying alarm actions on the server and requesting alarm
//! classifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::alarm::{AlarmAction, AlarmStatus, Classification};
use crate::domain::bulk::BulkStrategy;

/// Command sent to the action API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmCommand {
    /// A status-changing action.
    Transition(AlarmAction),
    /// Set the handler.
    Assign {
        /// New handler.
        handler: String,
    },
}

impl AlarmCommand {
    /// API path segment.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Transition(action) => action.as_str(),
            Self::Assign { .. } => "assign",
        }
    }
}

/// Request to apply a command to one alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmActionRequest {
    /// Alarm id.
    pub alarm_id: String,
    /// Command.
    pub command: AlarmCommand,
    /// Note or reason.
    pub note: Option<String>,
}

impl AlarmActionRequest {
    /// A status-changing request.
    #[must_use]
    pub fn transition(alarm_id: impl Into<String>, action: AlarmAction, note: Option<&str>) -> Self {
        Self {
            alarm_id: alarm_id.into(),
            command: AlarmCommand::Transition(action),
            note: note.map(str::to_string),
        }
    }

    /// A handler assignment.
    #[must_use]
    pub fn assign(alarm_id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            alarm_id: alarm_id.into(),
            command: AlarmCommand::Assign {
                handler: handler.into(),
            },
            note: None,
        }
    }
}

/// Server acknowledgment of an applied command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmActionAck {
    /// Alarm id echoed back.
    pub alarm_id: String,
    /// Status after the command, when reported.
    pub status: Option<AlarmStatus>,
    /// Handler recorded by the server.
    pub handler: Option<String>,
    /// Server timestamp of the change.
    pub handled_at: Option<DateTime<Utc>>,
}

/// Request for a classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRequest {
    /// Alarm id.
    pub alarm_id: String,
    /// Strategy the result is used for, when part of a bulk run.
    pub strategy: Option<BulkStrategy>,
}

impl ClassificationRequest {
    /// Classify a single alarm.
    #[must_use]
    pub fn single(alarm_id: impl Into<String>) -> Self {
        Self {
            alarm_id: alarm_id.into(),
            strategy: None,
        }
    }
}

/// Action API error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// The server does not know the alarm.
    #[error("alarm not found on server: {alarm_id}")]
    NotFound {
        /// Alarm id.
        alarm_id: String,
    },

    /// The server refused the command.
    #[error("action rejected: {message}")]
    Rejected {
        /// Server message.
        message: String,
    },

    /// The request failed in transit or the server failed.
    #[error("action transport error: {message}")]
    Transport {
        /// Error details.
        message: String,
    },
}

/// Port for alarm actions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlarmActionPort: Send + Sync {
    /// Apply a command to an alarm.
    async fn execute(&self, request: AlarmActionRequest) -> Result<AlarmActionAck, ActionError>;

    /// Classify an alarm.
    async fn classify(&self, request: ClassificationRequest) -> Result<Classification, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_paths() {
        assert_eq!(AlarmCommand::Transition(AlarmAction::Resolve).path(), "resolve");
        assert_eq!(AlarmCommand::Assign { handler: "x".into() }.path(), "assign");
    }

    #[test]
    fn transition_request_copies_note() {
        let request = AlarmActionRequest::transition("a-1", AlarmAction::Ignore, Some("sensor fault"));
        assert_eq!(request.note.as_deref(), Some("sensor fault"));
        assert_eq!(request.command, AlarmCommand::Transition(AlarmAction::Ignore));
    }
}
