//! Alarm domain errors.

use thiserror::Error;

use super::{AlarmAction, AlarmStatus};

/// Errors raised by alarm state transitions and lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlarmError {
    /// No alarm with this id is known locally.
    #[error("alarm not found: {id}")]
    NotFound {
        /// Alarm id.
        id: String,
    },

    /// The action is not allowed from the current status.
    #[error("cannot {action} alarm in status {from}")]
    InvalidTransition {
        /// Current status.
        from: AlarmStatus,
        /// Rejected action.
        action: AlarmAction,
    },

    /// `ignore` was called without a reason.
    #[error("ignoring an alarm requires a reason")]
    ReasonRequired,

    /// Handler assignment on a closed alarm.
    #[error("cannot assign a handler to {status} alarm")]
    AlreadyClosed {
        /// Terminal status of the alarm.
        status: AlarmStatus,
    },

    /// Handler name was empty.
    #[error("handler must not be empty")]
    EmptyHandler,
}
