//! Alarm records and the alarm lifecycle state machine.
//!
//! An [`Alarm`] moves through `Pending -> Processing -> {Resolved, Ignored}`.
//! Transitions are checked with [`Alarm::plan`] before any server round trip
//! and applied with [`Alarm::apply`] once the server has accepted them.
//! Server pushes are folded in with [`Alarm::merge_from`], which never moves
//! the status backwards.

mod errors;
mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use errors::AlarmError;
pub use status::{AlarmAction, AlarmSeverity, AlarmStatus};

/// A monitored equipment alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Server-assigned id.
    pub id: String,
    /// Equipment that raised the alarm.
    pub equipment_id: String,
    /// Severity.
    pub severity: AlarmSeverity,
    /// Lifecycle status.
    pub status: AlarmStatus,
    /// When the fault was detected.
    pub triggered_at: DateTime<Utc>,
    /// Monitoring point that tripped.
    pub monitoring_point: Option<String>,
    /// Fault name reported by the diagnostics service.
    pub fault_name: Option<String>,
    /// Suggested remediation.
    pub recommended_action: Option<String>,
    /// Who is handling (or handled) the alarm.
    pub handler: Option<String>,
    /// When the last transition happened.
    pub handled_at: Option<DateTime<Utc>>,
    /// Note from the last transition.
    pub handler_note: Option<String>,
    /// Replayed from the server buffer after a reconnect rather than raised live.
    pub buffered: bool,
    /// Transient emergency flag on critical alarms.
    pub emergency: bool,
    /// Last classification returned by the server.
    pub classification: Option<Classification>,
}

impl Alarm {
    /// Create a pending alarm.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        equipment_id: impl Into<String>,
        severity: AlarmSeverity,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            equipment_id: equipment_id.into(),
            severity,
            status: AlarmStatus::Pending,
            triggered_at,
            monitoring_point: None,
            fault_name: None,
            recommended_action: None,
            handler: None,
            handled_at: None,
            handler_note: None,
            buffered: false,
            emergency: false,
            classification: None,
        }
    }

    /// Check whether `action` may be applied, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns `ReasonRequired` for an `ignore` without a non-blank note and
    /// `InvalidTransition` when the action is not allowed from the current
    /// status.
    pub fn plan(&self, action: AlarmAction, note: Option<&str>) -> Result<TransitionOutcome, AlarmError> {
        if action == AlarmAction::Ignore && note.is_none_or(|n| n.trim().is_empty()) {
            return Err(AlarmError::ReasonRequired);
        }

        let to = action.target_status();
        match (self.status, action) {
            (from, _) if from == to => Ok(TransitionOutcome::Unchanged { status: from }),
            (AlarmStatus::Pending, _)
            | (AlarmStatus::Processing, AlarmAction::Resolve | AlarmAction::Ignore) => {
                Ok(TransitionOutcome::Applied { from: self.status, to })
            }
            (from, _) => Err(AlarmError::InvalidTransition { from, action }),
        }
    }

    /// Apply `action`, recording who handled it and when.
    ///
    /// A no-op transition leaves the record untouched.
    ///
    /// # Errors
    ///
    /// Same as [`Alarm::plan`].
    pub fn apply(
        &mut self,
        action: AlarmAction,
        note: Option<&str>,
        handler: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AlarmError> {
        let outcome = self.plan(action, note)?;
        if let TransitionOutcome::Applied { to, .. } = outcome {
            self.status = to;
            self.handled_at = Some(at);
            if let Some(handler) = handler {
                self.handler = Some(handler.to_string());
            }
            if let Some(note) = note {
                self.handler_note = Some(note.to_string());
            }
            self.emergency = false;
        }
        Ok(outcome)
    }

    /// Set the handler without changing status.
    ///
    /// # Errors
    ///
    /// Fails on terminal alarms and on a blank handler.
    pub fn assign(&mut self, handler: &str, at: DateTime<Utc>) -> Result<(), AlarmError> {
        if handler.trim().is_empty() {
            return Err(AlarmError::EmptyHandler);
        }
        if self.status.is_terminal() {
            return Err(AlarmError::AlreadyClosed { status: self.status });
        }
        self.handler = Some(handler.to_string());
        self.handled_at = Some(at);
        Ok(())
    }

    /// Fold a newer server copy of this alarm into the local record.
    ///
    /// Descriptive fields follow the server. The status only moves forward
    /// in the lifecycle, and a terminal status is never replaced. The
    /// classification is kept. The emergency flag is kept unless the status
    /// advanced, since someone acted on the alarm. Returns true when the
    /// status changed.
    pub fn merge_from(&mut self, incoming: Self) -> bool {
        self.equipment_id = incoming.equipment_id;
        self.severity = incoming.severity;
        self.triggered_at = incoming.triggered_at;
        self.buffered = incoming.buffered;
        if incoming.monitoring_point.is_some() {
            self.monitoring_point = incoming.monitoring_point;
        }
        if incoming.fault_name.is_some() {
            self.fault_name = incoming.fault_name;
        }
        if incoming.recommended_action.is_some() {
            self.recommended_action = incoming.recommended_action;
        }

        let advances = !self.status.is_terminal() && incoming.status.rank() > self.status.rank();
        if advances {
            self.status = incoming.status;
        }
        if advances || incoming.status == self.status {
            if incoming.handler.is_some() {
                self.handler = incoming.handler;
            }
            if incoming.handled_at.is_some() {
                self.handled_at = incoming.handled_at;
            }
            if incoming.handler_note.is_some() {
                self.handler_note = incoming.handler_note;
            }
        }
        if advances || self.status.is_terminal() {
            self.emergency = false;
        }
        advances
    }
}

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The status changed.
    Applied {
        /// Status before.
        from: AlarmStatus,
        /// Status after.
        to: AlarmStatus,
    },
    /// The alarm already had the target status.
    Unchanged {
        /// Current status.
        status: AlarmStatus,
    },
}

impl TransitionOutcome {
    /// Whether the status changed.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Status after the transition.
    #[must_use]
    pub const fn status(&self) -> AlarmStatus {
        match self {
            Self::Applied { to, .. } => *to,
            Self::Unchanged { status } => *status,
        }
    }
}

/// Server classification of an alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Fault category.
    pub category: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Action the classifier suggests, if any.
    pub suggested_action: Option<AlarmAction>,
    /// Free-form explanation.
    pub reasoning: Option<String>,
}

impl Classification {
    /// Whether the confidence reaches `threshold`.
    #[must_use]
    pub fn meets(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Alarm counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlarmCounts {
    /// Pending alarms.
    pub pending: usize,
    /// Alarms in handling.
    pub processing: usize,
    /// Resolved alarms.
    pub resolved: usize,
    /// Ignored alarms.
    pub ignored: usize,
    /// Alarms currently flagged as emergencies.
    pub emergency: usize,
}

impl AlarmCounts {
    /// Tally a collection of alarms.
    pub fn tally<'a>(alarms: impl IntoIterator<Item = &'a Alarm>) -> Self {
        alarms.into_iter().fold(Self::default(), |mut counts, alarm| {
            match alarm.status {
                AlarmStatus::Pending => counts.pending += 1,
                AlarmStatus::Processing => counts.processing += 1,
                AlarmStatus::Resolved => counts.resolved += 1,
                AlarmStatus::Ignored => counts.ignored += 1,
            }
            if alarm.emergency {
                counts.emergency += 1;
            }
            counts
        })
    }

    /// Total number of alarms.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.processing + self.resolved + self.ignored
    }
}
