//! Alarm severity and status value objects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alarm severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmSeverity {
    /// Informational.
    Low,
    /// Needs attention.
    Medium,
    /// Needs prompt attention.
    High,
    /// Safety relevant; raises the emergency flag.
    Critical,
}

impl AlarmSeverity {
    /// Returns true for severities that start emergency mode.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }

    /// Canonical string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm status.
///
/// `Pending -> Processing -> {Resolved, Ignored}`, with `Pending` allowed to
/// move straight to either terminal state. Nothing leads back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    /// Raised, not yet handled.
    Pending,
    /// Acknowledged and being handled.
    Processing,
    /// Closed as fixed.
    Resolved,
    /// Closed without action.
    Ignored,
}

impl AlarmStatus {
    /// Returns true if the alarm is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Ignored)
    }

    /// Returns true if the alarm still needs handling.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Position in the lifecycle. Terminal states share the highest rank.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Resolved | Self::Ignored => 2,
        }
    }

    /// Canonical string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Processing, Self::Resolved, Self::Ignored];
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status-changing action on an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmAction {
    /// Take the alarm into handling.
    Acknowledge,
    /// Close the alarm as fixed.
    Resolve,
    /// Close the alarm without action. Requires a reason.
    Ignore,
    /// Hand the alarm to a higher tier; moves it into handling.
    Escalate,
}

impl AlarmAction {
    /// Status the action leads to.
    #[must_use]
    pub const fn target_status(&self) -> AlarmStatus {
        match self {
            Self::Acknowledge | Self::Escalate => AlarmStatus::Processing,
            Self::Resolve => AlarmStatus::Resolved,
            Self::Ignore => AlarmStatus::Ignored,
        }
    }

    /// Canonical string form (also the action API path segment).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Resolve => "resolve",
            Self::Ignore => "ignore",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for AlarmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
