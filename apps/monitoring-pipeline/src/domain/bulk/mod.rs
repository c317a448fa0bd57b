//! Bulk operation status and per-item accounting.
//!
//! A [`BulkOperationStatus`] is created in `InProgress` before any item is
//! touched, then updated once per item. `processed_items + failed_items`
//! never exceeds `total_items` and reaches it exactly when the operation
//! completes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::alarm::AlarmAction;

/// What the bulk operation does to each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperationKind {
    /// The same action on every item.
    Apply(AlarmAction),
    /// Classify every item, then act on the confident ones.
    SmartProcess(BulkStrategy),
}

impl BulkOperationKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Apply(action) => action.as_str(),
            Self::SmartProcess(_) => "smart_process",
        }
    }
}

impl fmt::Display for BulkOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply(action) => write!(f, "{action}"),
            Self::SmartProcess(strategy) => write!(f, "smart_process({strategy})"),
        }
    }
}

/// Ordering and action selection for smart bulk processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStrategy {
    /// Given order; the classifier's suggested action wins when present.
    Auto,
    /// Highest severity first.
    BySeverity,
    /// Grouped by fault name.
    ByType,
    /// Grouped by equipment.
    ByEquipment,
}

impl BulkStrategy {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::BySeverity => "by_severity",
            Self::ByType => "by_type",
            Self::ByEquipment => "by_equipment",
        }
    }
}

impl fmt::Display for BulkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    /// Items are being processed.
    InProgress,
    /// Every item was attempted. Individual items may have failed.
    Completed,
    /// The operation could not be attempted at all.
    Failed,
}

/// Why a single item failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The alarm is not known locally.
    NotFound,
    /// The alarm's status does not allow the action.
    InvalidTransition {
        /// Detail.
        message: String,
    },
    /// The server refused the action.
    Rejected {
        /// Server message.
        message: String,
    },
    /// The request did not reach the server or got no usable answer.
    Transport {
        /// Detail.
        message: String,
    },
    /// Classification confidence was below the threshold; needs manual review.
    LowConfidence {
        /// Returned confidence.
        confidence: f64,
        /// Required confidence.
        threshold: f64,
    },
}

impl FailureReason {
    /// Label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Rejected { .. } => "rejected",
            Self::Transport { .. } => "transport",
            Self::LowConfidence { .. } => "low_confidence",
        }
    }

    /// Whether the item should be shown for manual review rather than retried.
    #[must_use]
    pub const fn needs_review(&self) -> bool {
        matches!(self, Self::LowConfidence { .. })
    }

    /// Whether retrying the item later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("alarm not found"),
            Self::InvalidTransition { message } => write!(f, "invalid transition: {message}"),
            Self::Rejected { message } => write!(f, "rejected: {message}"),
            Self::Transport { message } => write!(f, "transport: {message}"),
            Self::LowConfidence { confidence, threshold } => {
                write!(f, "confidence {confidence:.2} below {threshold:.2}")
            }
        }
    }
}

/// A failed item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    /// Alarm id.
    pub id: String,
    /// Failure reason.
    pub reason: FailureReason,
}

/// Progress and outcome of one bulk call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOperationStatus {
    /// Unique id of this run.
    pub operation_id: Uuid,
    /// What is being done.
    pub operation: BulkOperationKind,
    /// Number of items to process.
    pub total_items: usize,
    /// Items that succeeded.
    pub processed_items: usize,
    /// Items that failed, in completion order.
    pub failed_items: Vec<FailedItem>,
    /// Overall state.
    pub status: BulkStatus,
    /// Why the operation could not be attempted.
    pub failure: Option<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkOperationStatus {
    /// Start tracking an operation over `total_items` items.
    #[must_use]
    pub fn start(operation: BulkOperationKind, total_items: usize) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            operation,
            total_items,
            processed_items: 0,
            failed_items: Vec::new(),
            status: BulkStatus::InProgress,
            failure: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Count a successful item.
    pub fn record_success(&mut self) {
        if self.remaining() > 0 {
            self.processed_items += 1;
        }
    }

    /// Count a failed item.
    pub fn record_failure(&mut self, id: impl Into<String>, reason: FailureReason) {
        if self.remaining() > 0 {
            self.failed_items.push(FailedItem { id: id.into(), reason });
        }
    }

    /// Finish after every item was attempted.
    pub fn complete(&mut self) {
        self.status = BulkStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Finish without attempting the items.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = BulkStatus::Failed;
        self.failure = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Items not yet accounted for.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total_items
            .saturating_sub(self.processed_items + self.failed_items.len())
    }

    /// Ids of failed items.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed_items.iter().map(|item| item.id.as_str()).collect()
    }

    /// Ids whose failure calls for manual review.
    #[must_use]
    pub fn review_ids(&self) -> Vec<&str> {
        self.failed_items
            .iter()
            .filter(|item| item.reason.needs_review())
            .map(|item| item.id.as_str())
            .collect()
    }

    /// Whether the operation has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status != BulkStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_progress_with_nothing_processed() {
        let status = BulkOperationStatus::start(BulkOperationKind::Apply(AlarmAction::Resolve), 3);

        assert_eq!(status.status, BulkStatus::InProgress);
        assert_eq!(status.total_items, 3);
        assert_eq!(status.processed_items, 0);
        assert_eq!(status.remaining(), 3);
        assert!(status.completed_at.is_none());
    }

    #[test]
    fn partial_failure_still_completes() {
        let mut status = BulkOperationStatus::start(BulkOperationKind::Apply(AlarmAction::Resolve), 3);
        status.record_success();
        status.record_failure(
            "b",
            FailureReason::Rejected {
                message: "locked".into(),
            },
        );
        status.record_success();
        status.complete();

        assert_eq!(status.processed_items, 2);
        assert_eq!(status.failed_ids(), vec!["b"]);
        assert_eq!(status.status, BulkStatus::Completed);
        assert_eq!(status.remaining(), 0);
    }

    #[test]
    fn accounting_never_exceeds_total() {
        let mut status = BulkOperationStatus::start(BulkOperationKind::Apply(AlarmAction::Acknowledge), 1);
        status.record_success();
        status.record_success();
        status.record_failure("x", FailureReason::NotFound);

        assert_eq!(status.processed_items, 1);
        assert!(status.failed_items.is_empty());
    }

    #[test]
    fn low_confidence_is_review_not_retry() {
        let reason = FailureReason::LowConfidence {
            confidence: 0.4,
            threshold: 0.8,
        };
        assert!(reason.needs_review());
        assert!(!reason.is_retryable());
        assert!(FailureReason::Transport { message: "timeout".into() }.is_retryable());

        let mut status = BulkOperationStatus::start(BulkOperationKind::SmartProcess(BulkStrategy::Auto), 2);
        status.record_failure("a", reason);
        status.record_failure("b", FailureReason::NotFound);
        assert_eq!(status.review_ids(), vec!["a"]);
    }

    #[test]
    fn failed_operation_records_reason() {
        let mut status = BulkOperationStatus::start(BulkOperationKind::Apply(AlarmAction::Ignore), 0);
        status.fail("no alarms selected");

        assert_eq!(status.status, BulkStatus::Failed);
        assert_eq!(status.failure.as_deref(), Some("no alarms selected"));
        assert!(status.is_finished());
    }

    #[test]
    fn status_serializes_operation_id_as_string() {
        let status = BulkOperationStatus::start(BulkOperationKind::SmartProcess(BulkStrategy::Auto), 2);
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["operation_id"], status.operation_id.to_string());
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["total_items"], 2);
        assert!(json["completed_at"].is_null());
    }
}
