//! In-memory fakes for service tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use crate::application::ports::{
    ActionError, AlarmActionAck, AlarmActionPort, AlarmActionRequest, AlarmCommand, ClassificationRequest,
    Credential, OutboundRequest, RequestAck, RequestPort, TransportError, TransportEvent, TransportLink,
    TransportPort,
};
use crate::domain::alarm::Classification;
use crate::domain::events::PushEvent;

// =============================================================================
// Requester
// =============================================================================

/// Records requests and answers them from a script.
#[derive(Default)]
pub struct FakeRequester {
    requests: Mutex<Vec<OutboundRequest>>,
    refused: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    gate: Option<Semaphore>,
    closed: AtomicBool,
}

impl FakeRequester {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests wait until [`FakeRequester::release`] hands out permits.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn refuse(&self, equipment_id: &str) {
        self.refused.lock().insert(equipment_id.to_string());
    }

    pub fn fail(&self, equipment_id: &str) {
        self.failing.lock().insert(equipment_id.to_string());
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn subscribed_ids(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                OutboundRequest::Subscribe { equipment_id } => Some(equipment_id),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestPort for FakeRequester {
    async fn request(&self, request: OutboundRequest) -> Result<RequestAck, TransportError> {
        self.requests.lock().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| TransportError::Closed)?.forget();
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let target = match &request {
            OutboundRequest::Subscribe { equipment_id } | OutboundRequest::Unsubscribe { equipment_id } => {
                equipment_id.clone()
            }
            OutboundRequest::Ping => return Ok(RequestAck::ok()),
        };
        if self.failing.lock().contains(&target) {
            return Err(TransportError::Timeout);
        }
        if self.refused.lock().contains(&target) {
            return Ok(RequestAck::refused("equipment not found"));
        }
        Ok(RequestAck::ok())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Opens links from a script of outcomes. Unscripted opens fail.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    opens: AtomicUsize,
    requesters: Mutex<Vec<Arc<FakeRequester>>>,
    links: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    flapping: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, outcome: Result<(), TransportError>) {
        self.script.lock().push_back(outcome);
    }

    /// Every later open succeeds but the link is already closed and its
    /// requests never get an answer.
    pub fn flap(&self) {
        self.flapping.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Requester of the most recent link.
    pub fn requester(&self) -> Option<Arc<FakeRequester>> {
        self.requesters.lock().last().cloned()
    }

    pub fn requesters(&self) -> Vec<Arc<FakeRequester>> {
        self.requesters.lock().clone()
    }

    /// Push an event on the most recent link.
    pub async fn push(&self, event: PushEvent) {
        let sender = self.links.lock().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Push(event)).await;
        }
    }

    /// Close the most recent link from the server side.
    pub async fn drop_link(&self, reason: &str) {
        let sender = self.links.lock().last().cloned();
        if let Some(sender) = sender {
            let _ = sender
                .send(TransportEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl TransportPort for FakeTransport {
    async fn open(&self, _credential: &Credential) -> Result<TransportLink, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.flapping.load(Ordering::SeqCst) {
            let requester = FakeRequester::gated();
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(TransportEvent::Closed {
                reason: "reset by peer".to_string(),
            });
            self.requesters.lock().push(Arc::clone(&requester));
            return Ok(TransportLink {
                requester,
                events: rx,
            });
        }
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::ConnectFailed("unscripted".into())));
        outcome?;

        let requester = FakeRequester::new();
        let (tx, rx) = mpsc::channel(64);
        self.requesters.lock().push(Arc::clone(&requester));
        self.links.lock().push(tx);
        Ok(TransportLink {
            requester,
            events: rx,
        })
    }
}

// =============================================================================
// Alarm Actions
// =============================================================================

/// Accepts every command unless told otherwise.
#[derive(Default)]
pub struct FakeActions {
    executed: Mutex<Vec<AlarmActionRequest>>,
    classified: Mutex<Vec<String>>,
    errors: Mutex<HashMap<String, ActionError>>,
    classifications: Mutex<HashMap<String, Classification>>,
    handler: Mutex<Option<String>>,
}

impl FakeActions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, alarm_id: &str, error: ActionError) {
        self.errors.lock().insert(alarm_id.to_string(), error);
    }

    pub fn classify_as(&self, alarm_id: &str, classification: Classification) {
        self.classifications.lock().insert(alarm_id.to_string(), classification);
    }

    pub fn ack_handler(&self, handler: &str) {
        *self.handler.lock() = Some(handler.to_string());
    }

    pub fn executed(&self) -> Vec<AlarmActionRequest> {
        self.executed.lock().clone()
    }

    pub fn classified(&self) -> Vec<String> {
        self.classified.lock().clone()
    }
}

#[async_trait]
impl AlarmActionPort for FakeActions {
    async fn execute(&self, request: AlarmActionRequest) -> Result<AlarmActionAck, ActionError> {
        self.executed.lock().push(request.clone());
        if let Some(error) = self.errors.lock().get(&request.alarm_id) {
            return Err(error.clone());
        }
        let handler = match &request.command {
            AlarmCommand::Assign { handler } => Some(handler.clone()),
            AlarmCommand::Transition(_) => self.handler.lock().clone(),
        };
        Ok(AlarmActionAck {
            alarm_id: request.alarm_id,
            status: None,
            handler,
            handled_at: Some(Utc::now()),
        })
    }

    async fn classify(&self, request: ClassificationRequest) -> Result<Classification, ActionError> {
        self.classified.lock().push(request.alarm_id.clone());
        if let Some(error) = self.errors.lock().get(&request.alarm_id) {
            return Err(error.clone());
        }
        Ok(self
            .classifications
            .lock()
            .get(&request.alarm_id)
            .cloned()
            .unwrap_or(Classification {
                category: "sensor".into(),
                confidence: 0.9,
                suggested_action: None,
                reasoning: None,
            }))
    }
}
