//! Alarm Lifecycle Engine
//!
//! Owns the local alarm collection. Alarms arrive from push events (or a
//! full refetch through [`AlarmLifecycleEngine::replace_all`]) and change
//! status only through the actions here, each of which is validated
//! locally, confirmed by the action API, and then applied.
//!
//! New critical alarms are flagged as emergencies. The flag clears when the
//! alarm is handled or, failing that, when the emergency timer fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{ListenerError, PipelineListener};
use crate::application::ports::{
    ActionError, AlarmActionAck, AlarmActionPort, AlarmActionRequest, ClassificationRequest,
};
use crate::domain::alarm::{
    Alarm, AlarmAction, AlarmCounts, AlarmError, AlarmStatus, Classification, TransitionOutcome,
};
use crate::domain::bulk::BulkStrategy;
use crate::domain::events::PipelineEvent;
use crate::domain::monitoring::SessionInfo;
use crate::infrastructure::metrics;

/// Note recorded on alarms resolved by `AutoResolve`.
pub const AUTO_RESOLVE_NOTE: &str = "auto-resolved from emergency handling";

// =============================================================================
// Types
// =============================================================================

/// Failure of a lifecycle action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Rejected locally before any server call.
    #[error(transparent)]
    Alarm(#[from] AlarmError),

    /// The action API failed or refused.
    #[error(transparent)]
    Action(#[from] ActionError),
}

/// Action taken on an emergency alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    /// Take it into handling.
    Acknowledge,
    /// Hand it to a higher tier.
    Escalate,
    /// Resolve it with an automatic note.
    AutoResolve,
}

/// Why an emergency flag was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyClearReason {
    /// Nobody acted before the timer fired.
    Timeout,
    /// An action was taken on the alarm.
    Handled,
    /// The server closed the alarm.
    Closed,
}

/// Notification published on every change to the alarm collection.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmChange {
    /// An alarm was added or updated from the server.
    Upserted {
        /// The alarm after the update.
        alarm: Alarm,
        /// Whether it was new.
        created: bool,
    },
    /// The collection was replaced by a full refetch.
    Replaced {
        /// Number of alarms after the refetch.
        count: usize,
    },
    /// A local action changed an alarm's status.
    Transitioned {
        /// The alarm after the change.
        alarm: Alarm,
        /// Status before.
        from: AlarmStatus,
    },
    /// A handler was assigned.
    Assigned {
        /// The alarm after the change.
        alarm: Alarm,
    },
    /// A classification was stored.
    Classified {
        /// Alarm id.
        alarm_id: String,
        /// The classification.
        classification: Classification,
    },
    /// An emergency started.
    EmergencyRaised {
        /// Alarm id.
        alarm_id: String,
    },
    /// An emergency ended.
    EmergencyCleared {
        /// Alarm id.
        alarm_id: String,
        /// Why.
        reason: EmergencyClearReason,
    },
}

/// Result of a smart acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartOutcome {
    /// Classification obtained before acknowledging.
    pub classification: Classification,
    /// Transition result.
    pub outcome: TransitionOutcome,
}

/// Engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// How long an unhandled emergency flag stays up.
    pub emergency_duration: Duration,
    /// Capacity of the change notification channel.
    pub change_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            emergency_duration: Duration::from_secs(300),
            change_capacity: 1024,
        }
    }
}

type AlarmMap = Arc<RwLock<HashMap<String, Alarm>>>;
type TimerMap = Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>;

// =============================================================================
// Engine
// =============================================================================

/// Owner of the alarm collection and its state machine.
pub struct AlarmLifecycleEngine {
    alarms: AlarmMap,
    actions: Arc<dyn AlarmActionPort>,
    timers: TimerMap,
    next_timer: AtomicU64,
    shutdown: CancellationToken,
    config: LifecycleConfig,
    changes: broadcast::Sender<AlarmChange>,
    session: RwLock<Option<SessionInfo>>,
}

impl AlarmLifecycleEngine {
    /// Create an engine with an empty collection.
    #[must_use]
    pub fn new(actions: Arc<dyn AlarmActionPort>, config: LifecycleConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            alarms: Arc::new(RwLock::new(HashMap::new())),
            actions,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            config,
            changes,
            session: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Collection
    // -------------------------------------------------------------------------

    /// Add or update an alarm received from the server.
    ///
    /// A new, active, live (not buffered) critical alarm raises an emergency.
    /// A server update that moves an alarm forward clears its emergency.
    pub fn upsert(&self, incoming: Alarm) {
        let (alarm, created, raise, cleared) = {
            let mut alarms = self.alarms.write();
            if let Some(existing) = alarms.get_mut(&incoming.id) {
                let was_emergency = existing.emergency;
                existing.merge_from(incoming);
                let cleared = (was_emergency && !existing.emergency).then(|| {
                    if existing.status.is_terminal() {
                        EmergencyClearReason::Closed
                    } else {
                        EmergencyClearReason::Handled
                    }
                });
                (existing.clone(), false, false, cleared)
            } else {
                let mut alarm = incoming;
                let raise = alarm.severity.is_critical() && alarm.status.is_active() && !alarm.buffered;
                alarm.emergency = raise;
                alarms.insert(alarm.id.clone(), alarm.clone());
                (alarm, true, raise, None)
            }
        };

        tracing::debug!(alarm_id = %alarm.id, status = %alarm.status, created, "Alarm upserted");
        let alarm_id = alarm.id.clone();
        self.notify(AlarmChange::Upserted { alarm, created });

        if raise {
            tracing::warn!(alarm_id = %alarm_id, "Emergency alarm raised");
            self.start_emergency_timer(&alarm_id);
            self.notify(AlarmChange::EmergencyRaised { alarm_id });
        } else if let Some(reason) = cleared {
            self.stop_emergency(&alarm_id, reason);
        }
    }

    /// Add or update several alarms.
    pub fn upsert_batch(&self, alarms: Vec<Alarm>) {
        for alarm in alarms {
            self.upsert(alarm);
        }
    }

    /// Replace the whole collection after a full refetch.
    ///
    /// This is the only way alarms leave the collection. Emergency flags
    /// survive for alarms that are still present and active.
    pub fn replace_all(&self, fresh: Vec<Alarm>) {
        let (count, dropped) = {
            let mut alarms = self.alarms.write();
            let mut next = HashMap::with_capacity(fresh.len());
            for mut alarm in fresh {
                if let Some(previous) = alarms.get(&alarm.id) {
                    alarm.emergency = previous.emergency && alarm.status.is_active();
                    if alarm.classification.is_none() {
                        alarm.classification.clone_from(&previous.classification);
                    }
                }
                next.insert(alarm.id.clone(), alarm);
            }
            let dropped: Vec<String> = alarms
                .keys()
                .filter(|id| !next.get(*id).is_some_and(|alarm| alarm.emergency))
                .cloned()
                .collect();
            *alarms = next;
            (alarms.len(), dropped)
        };

        {
            let mut timers = self.timers.lock();
            for id in dropped {
                if let Some((_, token)) = timers.remove(&id) {
                    token.cancel();
                }
            }
        }

        tracing::info!(count, "Alarm collection replaced");
        self.notify(AlarmChange::Replaced { count });
    }

    /// Look up an alarm.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Alarm> {
        self.alarms.read().get(id).cloned()
    }

    /// All alarms, newest first.
    #[must_use]
    pub fn alarms(&self) -> Vec<Alarm> {
        self.collect(|_| true)
    }

    /// Alarms with the given status, newest first.
    #[must_use]
    pub fn by_status(&self, status: AlarmStatus) -> Vec<Alarm> {
        self.collect(|alarm| alarm.status == status)
    }

    /// Alarms raised by an equipment, newest first.
    #[must_use]
    pub fn by_equipment(&self, equipment_id: &str) -> Vec<Alarm> {
        self.collect(|alarm| alarm.equipment_id == equipment_id)
    }

    /// Alarms currently flagged as emergencies, newest first.
    #[must_use]
    pub fn emergencies(&self) -> Vec<Alarm> {
        self.collect(|alarm| alarm.emergency)
    }

    /// Counts by status.
    #[must_use]
    pub fn counts(&self) -> AlarmCounts {
        AlarmCounts::tally(self.alarms.read().values())
    }

    /// Change notifications.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<AlarmChange> {
        self.changes.subscribe()
    }

    /// Record the session whose username is the default handler.
    pub fn set_session(&self, session: SessionInfo) {
        *self.session.write() = Some(session);
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// `Pending -> Processing`. A no-op on alarms already in handling.
    ///
    /// # Errors
    ///
    /// Fails on unknown or closed alarms and when the action API fails.
    pub async fn acknowledge(&self, id: &str, note: Option<&str>) -> Result<TransitionOutcome, LifecycleError> {
        self.apply_action(id, AlarmAction::Acknowledge, note).await
    }

    /// `Pending | Processing -> Resolved`. A no-op on resolved alarms.
    ///
    /// # Errors
    ///
    /// Fails on unknown or ignored alarms and when the action API fails.
    pub async fn resolve(&self, id: &str, note: Option<&str>) -> Result<TransitionOutcome, LifecycleError> {
        self.apply_action(id, AlarmAction::Resolve, note).await
    }

    /// `Pending | Processing -> Ignored`. Requires a reason.
    ///
    /// # Errors
    ///
    /// Fails without a reason, on unknown or resolved alarms, and when the
    /// action API fails.
    pub async fn ignore(&self, id: &str, reason: &str) -> Result<TransitionOutcome, LifecycleError> {
        self.apply_action(id, AlarmAction::Ignore, Some(reason)).await
    }

    /// Set the handler without changing status.
    ///
    /// # Errors
    ///
    /// Fails on unknown or closed alarms, a blank handler, and when the
    /// action API fails.
    pub async fn assign(&self, id: &str, handler: &str) -> Result<Alarm, LifecycleError> {
        {
            let alarms = self.alarms.read();
            let alarm = alarms.get(id).ok_or_else(|| not_found(id))?;
            alarm.clone().assign(handler, Utc::now())?;
        }

        let ack = self.actions.execute(AlarmActionRequest::assign(id, handler)).await?;
        let handler = ack.handler.as_deref().unwrap_or(handler);
        let at = ack.handled_at.unwrap_or_else(Utc::now);

        let alarm = {
            let mut alarms = self.alarms.write();
            let alarm = alarms.get_mut(id).ok_or_else(|| not_found(id))?;
            alarm.assign(handler, at)?;
            alarm.clone()
        };
        tracing::info!(alarm_id = %id, handler = %handler, "Alarm assigned");
        self.notify(AlarmChange::Assigned { alarm: alarm.clone() });
        Ok(alarm)
    }

    /// Apply a status-changing action.
    ///
    /// The transition is checked locally first; a no-op never reaches the
    /// server. Otherwise the action API is called and the transition is
    /// applied once it succeeds.
    ///
    /// # Errors
    ///
    /// See the individual actions.
    pub async fn apply_action(
        &self,
        id: &str,
        action: AlarmAction,
        note: Option<&str>,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let planned = self.plan(id, action, note)?;
        if !planned.is_applied() {
            tracing::debug!(alarm_id = %id, %action, status = %planned.status(), "Action is a no-op");
            return Ok(planned);
        }

        let ack = self
            .actions
            .execute(AlarmActionRequest::transition(id, action, note))
            .await
            .inspect_err(|error| tracing::warn!(alarm_id = %id, %action, error = %error, "Alarm action failed"))?;

        self.apply_local(id, action, note, &ack)
    }

    /// Request a classification and store it on the alarm.
    ///
    /// # Errors
    ///
    /// Fails on unknown alarms and when the action API fails.
    pub async fn classify(&self, id: &str, strategy: Option<BulkStrategy>) -> Result<Classification, LifecycleError> {
        if !self.alarms.read().contains_key(id) {
            return Err(not_found(id).into());
        }

        let mut classification = self
            .actions
            .classify(ClassificationRequest {
                alarm_id: id.to_string(),
                strategy,
            })
            .await?;
        classification.confidence = if classification.confidence.is_nan() {
            0.0
        } else {
            classification.confidence.clamp(0.0, 1.0)
        };

        if let Some(alarm) = self.alarms.write().get_mut(id) {
            alarm.classification = Some(classification.clone());
        }
        self.notify(AlarmChange::Classified {
            alarm_id: id.to_string(),
            classification: classification.clone(),
        });
        Ok(classification)
    }

    /// Acknowledge after the server has classified the alarm.
    ///
    /// Follows the normal transition rules; the classification round trip
    /// must succeed before anything changes locally.
    ///
    /// # Errors
    ///
    /// Fails when acknowledge is not allowed, or when classification or the
    /// action fails.
    pub async fn smart_acknowledge(&self, id: &str, note: Option<&str>) -> Result<SmartOutcome, LifecycleError> {
        self.plan(id, AlarmAction::Acknowledge, note)?;
        let classification = self.classify(id, None).await?;
        let outcome = self.acknowledge(id, note).await?;
        Ok(SmartOutcome {
            classification,
            outcome,
        })
    }

    /// Act on an emergency alarm and clear its emergency flag immediately.
    ///
    /// # Errors
    ///
    /// Fails like the underlying action; the flag stays up on failure.
    pub async fn handle_emergency_alarm(
        &self,
        id: &str,
        action: EmergencyAction,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let outcome = match action {
            EmergencyAction::Acknowledge => self.apply_action(id, AlarmAction::Acknowledge, None).await?,
            EmergencyAction::Escalate => self.apply_action(id, AlarmAction::Escalate, None).await?,
            EmergencyAction::AutoResolve => self.apply_action(id, AlarmAction::Resolve, Some(AUTO_RESOLVE_NOTE)).await?,
        };
        self.stop_emergency(id, EmergencyClearReason::Handled);
        Ok(outcome)
    }

    /// Cancel every emergency timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.timers.lock().clear();
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn plan(&self, id: &str, action: AlarmAction, note: Option<&str>) -> Result<TransitionOutcome, LifecycleError> {
        let alarms = self.alarms.read();
        let alarm = alarms.get(id).ok_or_else(|| not_found(id))?;
        Ok(alarm.plan(action, note)?)
    }

    fn apply_local(
        &self,
        id: &str,
        action: AlarmAction,
        note: Option<&str>,
        ack: &AlarmActionAck,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let handler = ack
            .handler
            .clone()
            .or_else(|| self.session.read().as_ref().map(|session| session.username.clone()));
        let at = ack.handled_at.unwrap_or_else(Utc::now);

        let (outcome, alarm, emergency_cleared) = {
            let mut alarms = self.alarms.write();
            let alarm = alarms.get_mut(id).ok_or_else(|| not_found(id))?;
            let was_emergency = alarm.emergency;
            let outcome = alarm.apply(action, note, handler.as_deref(), at)?;
            if let Some(status) = ack.status {
                if !alarm.status.is_terminal() && status.rank() > alarm.status.rank() {
                    alarm.status = status;
                }
            }
            (outcome, alarm.clone(), was_emergency && !alarm.emergency)
        };

        if let TransitionOutcome::Applied { from, to } = outcome {
            tracing::info!(alarm_id = %id, %action, %from, %to, handler = ?alarm.handler, "Alarm transitioned");
            self.notify(AlarmChange::Transitioned { alarm, from });
        }
        if emergency_cleared {
            self.stop_emergency(id, EmergencyClearReason::Handled);
        }
        Ok(outcome)
    }

    fn start_emergency_timer(&self, id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(alarm_id = %id, "No runtime for emergency timer");
            return;
        };

        let ticket = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        if let Some((_, previous)) = self.timers.lock().insert(id.to_string(), (ticket, token.clone())) {
            previous.cancel();
        }

        let alarms = Arc::clone(&self.alarms);
        let timers = Arc::clone(&self.timers);
        let changes = self.changes.clone();
        let duration = self.config.emergency_duration;
        let alarm_id = id.to_string();

        runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(duration) => {}
            }

            {
                let mut timers = timers.lock();
                if timers.get(&alarm_id).is_some_and(|(current, _)| *current == ticket) {
                    timers.remove(&alarm_id);
                }
            }
            let cleared = match alarms.write().get_mut(&alarm_id) {
                Some(alarm) if alarm.emergency => {
                    alarm.emergency = false;
                    true
                }
                _ => false,
            };
            if cleared {
                tracing::info!(alarm_id = %alarm_id, "Emergency auto-cleared");
                metrics::record_emergency_auto_clear();
                let _ = changes.send(AlarmChange::EmergencyCleared {
                    alarm_id,
                    reason: EmergencyClearReason::Timeout,
                });
            }
        });
    }

    fn stop_emergency(&self, id: &str, reason: EmergencyClearReason) {
        let had_timer = self.timers.lock().remove(id).map(|(_, token)| token.cancel()).is_some();
        let cleared = match self.alarms.write().get_mut(id) {
            Some(alarm) if alarm.emergency => {
                alarm.emergency = false;
                true
            }
            _ => false,
        };
        if cleared || had_timer {
            tracing::debug!(alarm_id = %id, ?reason, "Emergency cleared");
            self.notify(AlarmChange::EmergencyCleared {
                alarm_id: id.to_string(),
                reason,
            });
        }
    }

    fn collect(&self, keep: impl Fn(&Alarm) -> bool) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self.alarms.read().values().filter(|alarm| keep(alarm)).cloned().collect();
        alarms.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then_with(|| a.id.cmp(&b.id)));
        alarms
    }

    fn notify(&self, change: AlarmChange) {
        let _ = self.changes.send(change);
    }
}

impl PipelineListener for AlarmLifecycleEngine {
    fn name(&self) -> &str {
        "alarm-store"
    }

    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError> {
        match event {
            PipelineEvent::SessionStarted(session) => self.set_session(session.clone()),
            PipelineEvent::Alarm(alarm) => self.upsert(alarm.clone()),
            PipelineEvent::AlarmBatch(alarms) => self.upsert_batch(alarms.clone()),
            PipelineEvent::MonitoringData(_) | PipelineEvent::MonitoringBatch(_) | PipelineEvent::EquipmentHealth { .. } => {}
        }
        Ok(())
    }
}

impl Drop for AlarmLifecycleEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for AlarmLifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmLifecycleEngine")
            .field("counts", &self.counts())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn not_found(id: &str) -> AlarmError {
    AlarmError::NotFound { id: id.to_string() }
}

// =============================================================================
// Tests
// =============================================================================
