//! Bulk Operation Coordinator
//!
//! Applies one action to many alarms with best-effort semantics: every item
//! is attempted, failures are collected per item and never abort siblings.
//! Items run with bounded fan-out; completions are folded into the
//! [`BulkOperationStatus`] by a single consumer, so counts stay consistent.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio::sync::watch;

use super::alarm_lifecycle::{AlarmLifecycleEngine, LifecycleError};
use crate::application::ports::ActionError;
use crate::domain::alarm::{AlarmAction, AlarmError};
use crate::domain::bulk::{BulkOperationKind, BulkOperationStatus, BulkStrategy, FailureReason};
use crate::infrastructure::metrics;

// =============================================================================
// Errors and configuration
// =============================================================================

/// A bulk operation that could not be attempted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BulkError {
    /// No ids were given.
    #[error("no alarm ids given")]
    Empty,

    /// More ids than allowed in one operation.
    #[error("{count} alarm ids exceed the limit of {max}")]
    TooMany {
        /// Distinct ids given.
        count: usize,
        /// Configured limit.
        max: usize,
    },

    /// `ignore` without a reason.
    #[error("ignore requires a reason")]
    ReasonRequired,

    /// Confidence threshold outside `[0, 1]`.
    #[error("confidence threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
}

/// Coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkConfig {
    /// Items in flight at once.
    pub concurrency: usize,
    /// Largest accepted id list.
    pub max_items: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_items: 500,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs bulk alarm operations through the lifecycle engine.
pub struct BulkCoordinator {
    engine: Arc<AlarmLifecycleEngine>,
    config: BulkConfig,
    progress: watch::Sender<Option<BulkOperationStatus>>,
}

impl BulkCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(engine: Arc<AlarmLifecycleEngine>, config: BulkConfig) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            engine,
            config: BulkConfig {
                concurrency: config.concurrency.max(1),
                max_items: config.max_items,
            },
            progress,
        }
    }

    /// Progress of the most recent operation.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Option<BulkOperationStatus>> {
        self.progress.subscribe()
    }

    /// Apply `action` to every id.
    ///
    /// The returned status is `Completed` whenever every item was attempted,
    /// whatever the number of item failures.
    ///
    /// # Errors
    ///
    /// Returns a [`BulkError`] when the operation cannot be attempted; the
    /// progress channel then shows it as `Failed`.
    pub async fn bulk_apply(
        &self,
        ids: &[String],
        action: AlarmAction,
        note: Option<&str>,
    ) -> Result<BulkOperationStatus, BulkError> {
        let kind = BulkOperationKind::Apply(action);
        let ids = distinct(ids);
        self.check(kind, &ids, action, note, None)?;

        Ok(self
            .run(kind, ids, |id| async move {
                self.engine
                    .apply_action(&id, action, note)
                    .await
                    .map(|_| ())
                    .map_err(failure_reason)
            })
            .await)
    }

    /// Classify every id, then apply `action` to those classified with at
    /// least `threshold` confidence.
    ///
    /// Items below the threshold fail with [`FailureReason::LowConfidence`]
    /// for manual review. Under [`BulkStrategy::Auto`] a suggested action on
    /// the classification replaces `action`, except a suggested `ignore`
    /// when no reason was given.
    ///
    /// # Errors
    ///
    /// Same as [`BulkCoordinator::bulk_apply`], plus a threshold outside
    /// `[0, 1]`.
    pub async fn smart_bulk_process(
        &self,
        ids: &[String],
        strategy: BulkStrategy,
        threshold: f64,
        action: AlarmAction,
        note: Option<&str>,
    ) -> Result<BulkOperationStatus, BulkError> {
        let kind = BulkOperationKind::SmartProcess(strategy);
        let ids = self.order(distinct(ids), strategy);
        self.check(kind, &ids, action, note, Some(threshold))?;

        Ok(self
            .run(kind, ids, |id| async move {
                let classification = self
                    .engine
                    .classify(&id, Some(strategy))
                    .await
                    .map_err(failure_reason)?;
                if !classification.meets(threshold) {
                    return Err(FailureReason::LowConfidence {
                        confidence: classification.confidence,
                        threshold,
                    });
                }
                let action = match (strategy, classification.suggested_action) {
                    (BulkStrategy::Auto, Some(AlarmAction::Ignore)) if !has_reason(note) => {
                        tracing::debug!(alarm_id = %id, fallback = %action, "Suggested ignore without a reason");
                        action
                    }
                    (BulkStrategy::Auto, Some(suggested)) => suggested,
                    _ => action,
                };
                self.engine
                    .apply_action(&id, action, note)
                    .await
                    .map(|_| ())
                    .map_err(failure_reason)
            })
            .await)
    }

    fn check(
        &self,
        kind: BulkOperationKind,
        ids: &[String],
        action: AlarmAction,
        note: Option<&str>,
        threshold: Option<f64>,
    ) -> Result<(), BulkError> {
        let violation = if ids.is_empty() {
            Some(BulkError::Empty)
        } else if ids.len() > self.config.max_items {
            Some(BulkError::TooMany {
                count: ids.len(),
                max: self.config.max_items,
            })
        } else if action == AlarmAction::Ignore && !has_reason(note) {
            Some(BulkError::ReasonRequired)
        } else {
            threshold
                .filter(|t| !(0.0..=1.0).contains(t))
                .map(BulkError::InvalidThreshold)
        };

        match violation {
            None => Ok(()),
            Some(error) => {
                let mut status = BulkOperationStatus::start(kind, ids.len());
                status.fail(error.to_string());
                tracing::warn!(
                    operation_id = %status.operation_id,
                    operation = %kind,
                    error = %error,
                    "Bulk operation not attempted"
                );
                self.progress.send_replace(Some(status));
                Err(error)
            }
        }
    }

    async fn run<F, Fut>(&self, kind: BulkOperationKind, ids: Vec<String>, item: F) -> BulkOperationStatus
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), FailureReason>>,
    {
        let mut status = BulkOperationStatus::start(kind, ids.len());
        tracing::info!(
            operation_id = %status.operation_id,
            operation = %kind,
            total = status.total_items,
            "Bulk operation started"
        );
        self.progress.send_replace(Some(status.clone()));

        let mut completions = stream::iter(ids)
            .map(|id| {
                let work = item(id.clone());
                async move { (id, work.await) }
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((id, result)) = completions.next().await {
            match result {
                Ok(()) => {
                    metrics::record_bulk_item(kind.as_str(), "success");
                    status.record_success();
                }
                Err(reason) => {
                    tracing::debug!(operation_id = %status.operation_id, alarm_id = %id, reason = %reason, "Bulk item failed");
                    metrics::record_bulk_item(kind.as_str(), reason.as_str());
                    status.record_failure(id, reason);
                }
            }
            self.progress.send_replace(Some(status.clone()));
        }

        status.complete();
        tracing::info!(
            operation_id = %status.operation_id,
            operation = %kind,
            processed = status.processed_items,
            failed = status.failed_items.len(),
            "Bulk operation completed"
        );
        self.progress.send_replace(Some(status.clone()));
        status
    }

    fn order(&self, mut ids: Vec<String>, strategy: BulkStrategy) -> Vec<String> {
        match strategy {
            BulkStrategy::Auto => {}
            BulkStrategy::BySeverity => {
                ids.sort_by_cached_key(|id| Reverse(self.engine.get(id).map(|alarm| alarm.severity)));
            }
            BulkStrategy::ByType => {
                ids.sort_by_cached_key(|id| {
                    let alarm = self.engine.get(id);
                    (alarm.is_none(), alarm.and_then(|alarm| alarm.fault_name))
                });
            }
            BulkStrategy::ByEquipment => {
                ids.sort_by_cached_key(|id| {
                    let alarm = self.engine.get(id);
                    (alarm.is_none(), alarm.map(|alarm| alarm.equipment_id))
                });
            }
        }
        ids
    }
}

impl std::fmt::Debug for BulkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn has_reason(note: Option<&str>) -> bool {
    note.is_some_and(|n| !n.trim().is_empty())
}

/// Drop repeated ids, keeping first occurrences in order.
fn distinct(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

fn failure_reason(error: LifecycleError) -> FailureReason {
    match error {
        LifecycleError::Alarm(AlarmError::NotFound { .. }) | LifecycleError::Action(ActionError::NotFound { .. }) => {
            FailureReason::NotFound
        }
        LifecycleError::Alarm(error) => FailureReason::InvalidTransition {
            message: error.to_string(),
        },
        LifecycleError::Action(ActionError::Rejected { message }) => FailureReason::Rejected { message },
        LifecycleError::Action(ActionError::Transport { message }) => FailureReason::Transport { message },
    }
}

// =============================================================================
// Tests
// =============================================================================
