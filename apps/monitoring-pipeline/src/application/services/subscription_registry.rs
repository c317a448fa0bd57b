//! Subscription Registry
//!
//! Tracks which equipment ids the client wants live data for and keeps the
//! server side in step with it.
//!
//! # Design
//!
//! - Repeat `subscribe` calls for a confirmed id send nothing.
//! - Concurrent `subscribe` calls for the same id share one in-flight
//!   request; later callers observe the first caller's outcome.
//! - While no link is attached, `subscribe` only records the intent. The
//!   connection manager replays every active id after each (re)connect.
//! - A dropped link keeps all entries and marks them unconfirmed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::application::ports::{OutboundRequest, RequestPort, TransportError};
use crate::domain::subscription::{EquipmentId, Subscription, SubscriptionBook};
use crate::infrastructure::metrics;

// =============================================================================
// Errors and Results
// =============================================================================

/// Subscription failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Blank equipment id.
    #[error("equipment id must not be empty")]
    EmptyEquipmentId,

    /// The server declined the subscription.
    #[error("subscription to {equipment_id} refused: {message}")]
    Refused {
        /// Equipment id.
        equipment_id: EquipmentId,
        /// Server message.
        message: String,
    },

    /// The request did not complete.
    #[error("subscription request failed: {0}")]
    Transport(#[from] TransportError),
}

/// How a subscription request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request was sent and acknowledged.
    Sent,
    /// Another caller's in-flight request was awaited.
    Coalesced,
    /// The server already confirmed this id on the current link.
    AlreadyConfirmed,
    /// No link is attached; the id will be sent on the next connect.
    Deferred,
}

/// Result of replaying subscriptions on a new link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Ids confirmed on the new link.
    pub replayed: Vec<EquipmentId>,
    /// Ids that failed; they stay active and are retried on the next connect.
    pub failed: Vec<(EquipmentId, SubscriptionError)>,
}

impl ReplayReport {
    /// Whether every id was replayed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// Registry
// =============================================================================

type SubscribeFuture = Shared<BoxFuture<'static, Result<(), SubscriptionError>>>;

struct InFlight {
    ticket: u64,
    future: SubscribeFuture,
}

#[derive(Default)]
struct RegistryState {
    book: SubscriptionBook,
    requester: Option<Arc<dyn RequestPort>>,
    link_id: u64,
    inflight: HashMap<EquipmentId, InFlight>,
    next_ticket: u64,
}

/// Owner of the subscription set.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry with no link attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to live data for an equipment.
    ///
    /// Returns true when this call sent a new subscription request, false
    /// when the id was already confirmed, another caller's request was
    /// awaited, or no link is attached.
    ///
    /// # Errors
    ///
    /// Returns an error for a blank id, or when the request this call sent
    /// (or awaited) was refused or failed. The id stays active either way.
    pub async fn subscribe(&self, equipment_id: &str) -> Result<bool, SubscriptionError> {
        let equipment_id = equipment_id.trim();
        if equipment_id.is_empty() {
            return Err(SubscriptionError::EmptyEquipmentId);
        }

        {
            let mut state = self.state.lock();
            if state.book.record_intent(equipment_id, Utc::now()) {
                tracing::info!(equipment_id = %equipment_id, "Subscription added");
            }
            metrics::set_active_subscriptions(state.book.len());
        }

        let outcome = self.request(equipment_id).await?;
        tracing::debug!(equipment_id = %equipment_id, ?outcome, "Subscribe handled");
        Ok(outcome == RequestOutcome::Sent)
    }

    /// Unsubscribe from an equipment.
    ///
    /// Waits for any in-flight subscribe for the id, removes the entry, and
    /// tells the server if it had confirmed the subscription. Failures are
    /// logged; the entry is gone locally regardless.
    pub async fn unsubscribe(&self, equipment_id: &str) {
        let pending = self
            .state
            .lock()
            .inflight
            .get(equipment_id)
            .map(|inflight| inflight.future.clone());
        if let Some(pending) = pending {
            let _ = pending.await;
        }

        let (removed, requester) = {
            let mut state = self.state.lock();
            let removed = state.book.remove(equipment_id);
            metrics::set_active_subscriptions(state.book.len());
            (removed, state.requester.clone())
        };

        let Some(removed) = removed else {
            tracing::debug!(equipment_id = %equipment_id, "Unsubscribe for unknown id");
            return;
        };
        tracing::info!(equipment_id = %equipment_id, "Subscription removed");

        let Some(requester) = requester.filter(|_| removed.confirmed) else {
            return;
        };

        let started = Instant::now();
        let result = requester
            .request(OutboundRequest::Unsubscribe {
                equipment_id: equipment_id.to_string(),
            })
            .await;
        metrics::record_request_duration("unsubscribe:equipment", started.elapsed());

        match result {
            Ok(ack) if ack.success => {
                tracing::debug!(equipment_id = %equipment_id, "Unsubscribe acknowledged");
            }
            Ok(ack) => {
                tracing::warn!(
                    equipment_id = %equipment_id,
                    message = ack.message.as_deref().unwrap_or_default(),
                    "Unsubscribe refused"
                );
            }
            Err(error) => {
                tracing::warn!(equipment_id = %equipment_id, error = %error, "Unsubscribe failed");
            }
        }
    }

    /// Re-send every active subscription on the attached link.
    ///
    /// Tolerates partial failure: failed ids stay active and unconfirmed.
    pub async fn replay_all(&self) -> ReplayReport {
        let ids = self.state.lock().book.active_ids();
        let results = join_all(ids.iter().map(|id| self.request(id))).await;

        let mut report = ReplayReport::default();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(RequestOutcome::Deferred) => {
                    report
                        .failed
                        .push((id, SubscriptionError::Transport(TransportError::NotConnected)));
                }
                Ok(_) => report.replayed.push(id),
                Err(error) => {
                    tracing::warn!(equipment_id = %id, error = %error, "Replay failed");
                    report.failed.push((id, error));
                }
            }
        }

        tracing::info!(
            replayed = report.replayed.len(),
            failed = report.failed.len(),
            "Subscriptions replayed"
        );
        report
    }

    /// Attach a new link. Returns its id for [`SubscriptionRegistry::detach`].
    pub fn attach(&self, requester: Arc<dyn RequestPort>) -> u64 {
        let mut state = self.state.lock();
        state.link_id += 1;
        state.requester = Some(requester);
        state.inflight.clear();
        state.link_id
    }

    /// Detach the link with `link_id` after it closed.
    ///
    /// Marks every subscription unconfirmed. A stale id is ignored.
    pub fn detach(&self, link_id: u64) -> bool {
        let mut state = self.state.lock();
        if state.link_id != link_id || state.requester.is_none() {
            return false;
        }
        state.link_id += 1;
        state.requester = None;
        state.inflight.clear();
        let unconfirmed = state.book.mark_all_unconfirmed();
        tracing::debug!(unconfirmed, "Link detached from subscription registry");
        true
    }

    /// Whether a link is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state.lock().requester.is_some()
    }

    /// Whether an id is actively subscribed.
    #[must_use]
    pub fn is_active(&self, equipment_id: &str) -> bool {
        self.state.lock().book.is_active(equipment_id)
    }

    /// Active ids, sorted.
    #[must_use]
    pub fn active_ids(&self) -> Vec<EquipmentId> {
        self.state.lock().book.active_ids()
    }

    /// All subscriptions, sorted by id.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().book.snapshot()
    }

    /// Number of subscriptions confirmed on the current link.
    #[must_use]
    pub fn confirmed_count(&self) -> usize {
        self.state.lock().book.confirmed_count()
    }

    async fn request(&self, equipment_id: &str) -> Result<RequestOutcome, SubscriptionError> {
        let (future, outcome) = {
            let mut state = self.state.lock();
            if let Some(inflight) = state.inflight.get(equipment_id) {
                (inflight.future.clone(), RequestOutcome::Coalesced)
            } else if !state.book.needs_request(equipment_id) {
                return Ok(RequestOutcome::AlreadyConfirmed);
            } else if let Some(requester) = state.requester.clone() {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                let future = send_subscribe(
                    Arc::clone(&self.state),
                    requester,
                    equipment_id.to_string(),
                    ticket,
                    state.link_id,
                )
                .boxed()
                .shared();
                state.inflight.insert(
                    equipment_id.to_string(),
                    InFlight {
                        ticket,
                        future: future.clone(),
                    },
                );
                (future, RequestOutcome::Sent)
            } else {
                return Ok(RequestOutcome::Deferred);
            }
        };

        future.await.map(|()| outcome)
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &state.book.len())
            .field("attached", &state.requester.is_some())
            .field("in_flight", &state.inflight.len())
            .finish()
    }
}

async fn send_subscribe(
    state: Arc<Mutex<RegistryState>>,
    requester: Arc<dyn RequestPort>,
    equipment_id: EquipmentId,
    ticket: u64,
    link_id: u64,
) -> Result<(), SubscriptionError> {
    let started = Instant::now();
    let result = requester
        .request(OutboundRequest::Subscribe {
            equipment_id: equipment_id.clone(),
        })
        .await;
    metrics::record_request_duration("subscribe:equipment", started.elapsed());

    let mut state = state.lock();
    if state
        .inflight
        .get(&equipment_id)
        .is_some_and(|inflight| inflight.ticket == ticket)
    {
        state.inflight.remove(&equipment_id);
    }

    match result {
        Ok(ack) if ack.success => {
            if state.link_id == link_id && state.book.confirm(&equipment_id) {
                tracing::debug!(equipment_id = %equipment_id, room = ?ack.room, "Subscription confirmed");
            }
            Ok(())
        }
        Ok(ack) => Err(SubscriptionError::Refused {
            equipment_id,
            message: ack.message.unwrap_or_else(|| "no reason given".to_string()),
        }),
        Err(error) => Err(SubscriptionError::Transport(error)),
    }
}

// =============================================================================
// Tests
// =============================================================================
