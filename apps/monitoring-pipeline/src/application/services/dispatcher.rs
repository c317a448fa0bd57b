//! Event Dispatcher
//!
//! Routes pipeline events by kind to registered listeners. Chunked transfers
//! are joined by the [`BatchAssemblyService`] on the way through, so
//! listeners only ever see complete batches.
//!
//! # Design
//!
//! Registrations live in a copy-on-write list. Delivery iterates a snapshot,
//! so listeners may register or unregister (themselves included) while an
//! event is being delivered. A listener that returns an error or panics is
//! logged and counted; the remaining listeners still receive the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::batch_assembly::BatchAssemblyService;
use crate::domain::events::{EventKind, PipelineEvent, PushEvent};
use crate::infrastructure::metrics::{self, ListenerFailure};

// =============================================================================
// Listener Interface
// =============================================================================

/// Error returned by a listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    /// The listener could not handle the event.
    #[error("listener failed: {0}")]
    Failed(String),

    /// The listener has shut down.
    #[error("listener closed")]
    Closed,
}

/// A consumer of pipeline events.
pub trait PipelineListener: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// An error is logged and counted by the dispatcher; it does not affect
    /// other listeners.
    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError>;
}

/// Handle returned by [`EventDispatcher::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    kinds: Vec<EventKind>,
    listener: Arc<dyn PipelineListener>,
}

impl Registration {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Outcome of delivering one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Listeners that handled the event.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes events to listeners by kind.
pub struct EventDispatcher {
    registrations: RwLock<Arc<Vec<Registration>>>,
    next_id: AtomicU64,
    batches: Arc<BatchAssemblyService>,
}

impl EventDispatcher {
    /// Create a dispatcher feeding chunks through `batches`.
    #[must_use]
    pub fn new(batches: Arc<BatchAssemblyService>) -> Self {
        Self {
            registrations: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            batches,
        }
    }

    /// Register a listener for the given kinds.
    pub fn register(&self, kinds: &[EventKind], listener: Arc<dyn PipelineListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(listener = listener.name(), ?kinds, "Listener registered");

        let registration = Registration {
            id,
            kinds: kinds.to_vec(),
            listener,
        };
        let mut guard = self.registrations.write();
        let mut next: Vec<Registration> = guard.iter().cloned().collect();
        next.push(registration);
        *guard = Arc::new(next);
        id
    }

    /// Register a listener for every kind.
    pub fn register_all(&self, listener: Arc<dyn PipelineListener>) -> ListenerId {
        self.register(&EventKind::ALL, listener)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut guard = self.registrations.write();
        if !guard.iter().any(|registration| registration.id == id) {
            return false;
        }
        let next: Vec<Registration> = guard.iter().filter(|registration| registration.id != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Route a decoded push event.
    ///
    /// Chunks are buffered until their batch completes. Link-level events
    /// (`disconnect`, `connect_error`) are not routed; the transport handles
    /// them.
    pub fn dispatch(&self, event: PushEvent) -> DeliveryReport {
        metrics::record_event_received(event.name());

        let routed = match event {
            PushEvent::Connected(session) => PipelineEvent::SessionStarted(session),
            PushEvent::Alarm(alarm) => PipelineEvent::Alarm(alarm),
            PushEvent::AlarmBatch(alarms) => PipelineEvent::AlarmBatch(alarms),
            PushEvent::MonitoringData(point) => PipelineEvent::MonitoringData(point),
            PushEvent::MonitoringChunk(chunk) => match self.batches.ingest(chunk) {
                Some(batch) => PipelineEvent::MonitoringBatch(batch),
                None => return DeliveryReport::default(),
            },
            PushEvent::EquipmentHealth { health, warning } => PipelineEvent::EquipmentHealth { health, warning },
            PushEvent::Disconnect { .. } | PushEvent::ConnectError { .. } => {
                tracing::debug!(event = event.name(), "Link event not routed");
                return DeliveryReport::default();
            }
        };

        self.publish(&routed)
    }

    /// Deliver an event to every listener registered for its kind.
    pub fn publish(&self, event: &PipelineEvent) -> DeliveryReport {
        let kind = event.kind();
        let snapshot = self.registrations.read().clone();
        let mut report = DeliveryReport::default();

        for registration in snapshot.iter().filter(|registration| registration.wants(kind)) {
            let name = registration.listener.name();
            match catch_unwind(AssertUnwindSafe(|| registration.listener.on_event(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(error)) => {
                    report.failed += 1;
                    tracing::error!(listener = name, kind = kind.as_str(), error = %error, "Listener failed");
                    metrics::record_listener_failure(name, ListenerFailure::Error);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(listener = name, kind = kind.as_str(), "Listener panicked");
                    metrics::record_listener_failure(name, ListenerFailure::Panic);
                }
            }
        }

        report
    }

    /// The batch assembly service chunks are routed through.
    #[must_use]
    pub fn batches(&self) -> &Arc<BatchAssemblyService> {
        &self.batches
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
