//! Connection Manager
//!
//! Owns the single push connection: opens it, pumps its events into the
//! dispatcher, replays subscriptions after every (re)connect and retries
//! with exponential backoff when the link fails.
//!
//! # State Machine
//!
//! ```text
//! Disconnected/Error --connect--> Connecting --link up, replay done--> Connected
//!                                      |                                   |
//!                                      +-- failure --> Reconnecting <------+ link lost
//!                                                        |   |
//!                          auth failure / retries spent -+   +-- link up, replay done --> Connected
//!                                                        v
//!                                                      Error
//! ```
//!
//! `disconnect` moves any state to `Disconnected` and cancels the driver,
//! including a pending backoff sleep.

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::dispatcher::EventDispatcher;
use super::subscription_registry::SubscriptionRegistry;
use crate::application::ports::{Credential, TransportEvent, TransportLink, TransportPort};
use crate::domain::connection::{
    BackoffConfig, BackoffPolicy, ConnectionErrorReason, ConnectionState, ConnectionStatus,
};
use crate::domain::events::PushEvent;
use crate::domain::monitoring::SessionInfo;
use crate::infrastructure::metrics;

/// Callback invoked on every status change.
pub type StatusCallback = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// How a link ended.
struct LinkLoss {
    reason: String,
    /// Whether the link got through replay and was announced as Connected.
    was_connected: bool,
}

struct Inner {
    status: ConnectionStatus,
    generation: u64,
    run: Option<CancellationToken>,
    link_id: Option<u64>,
}

/// Owner of the push connection.
pub struct ConnectionManager {
    transport: Arc<dyn TransportPort>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
    inner: Mutex<Inner>,
    publish_order: ReentrantMutex<()>,
    callbacks: RwLock<Arc<Vec<StatusCallback>>>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    status_watch: watch::Sender<ConnectionStatus>,
    session: RwLock<Option<SessionInfo>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`ConnectionManager::connect`].
    #[must_use]
    pub fn new(
        transport: Arc<dyn TransportPort>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        backoff: BackoffConfig,
        status_capacity: usize,
    ) -> Self {
        let initial = ConnectionStatus::disconnected();
        let (status_tx, _) = broadcast::channel(status_capacity.max(1));
        let (status_watch, _) = watch::channel(initial.clone());
        Self {
            transport,
            registry,
            dispatcher,
            backoff,
            shutdown: CancellationToken::new(),
            inner: Mutex::new(Inner {
                status: initial,
                generation: 0,
                run: None,
                link_id: None,
            }),
            publish_order: ReentrantMutex::new(()),
            callbacks: RwLock::new(Arc::new(Vec::new())),
            status_tx,
            status_watch,
            session: RwLock::new(None),
        }
    }

    /// Start connecting with `credential`.
    ///
    /// A no-op (returning false) while Connecting, Connected or Reconnecting,
    /// and after [`ConnectionManager::shutdown`]. From Disconnected or Error
    /// it spawns a new connection driver.
    pub fn connect(self: &Arc<Self>, credential: Credential) -> bool {
        let _order = self.publish_order.lock();
        if self.shutdown.is_cancelled() {
            tracing::warn!("Connect refused after shutdown");
            return false;
        }
        let status = ConnectionStatus::new(ConnectionState::Connecting);
        let (generation, token) = {
            let mut inner = self.inner.lock();
            if inner.status.state.is_live() {
                tracing::debug!(state = %inner.status.state, "Connect ignored");
                return false;
            }
            inner.generation += 1;
            let token = self.shutdown.child_token();
            inner.run = Some(token.clone());
            inner.status = status.clone();
            (inner.generation, token)
        };
        self.publish(&status);

        tracing::info!("Connecting to monitoring server");
        tokio::spawn(Arc::clone(self).drive(credential, token, generation));
        true
    }

    /// Disconnect from any state, cancelling pending retries.
    pub fn disconnect(&self) {
        let _order = self.publish_order.lock();
        let status = ConnectionStatus::disconnected();
        let (run, link_id, previous) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            let previous = inner.status.state;
            inner.status = status.clone();
            (inner.run.take(), inner.link_id.take(), previous)
        };
        if let Some(run) = run {
            run.cancel();
        }
        if let Some(link_id) = link_id {
            self.registry.detach(link_id);
        }

        if previous != ConnectionState::Disconnected {
            tracing::info!(from = %previous, "Disconnected");
            self.publish(&status);
        }
    }

    /// Disconnect and stop accepting new connections' background work.
    pub fn shutdown(&self) {
        self.disconnect();
        self.shutdown.cancel();
    }

    /// Register a status callback. It runs synchronously on every change.
    pub fn on_status_change(&self, callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static) {
        let mut guard = self.callbacks.write();
        let mut next: Vec<StatusCallback> = guard.iter().cloned().collect();
        next.push(Arc::new(callback));
        *guard = Arc::new(next);
    }

    /// Stream of every status change.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Watch the latest status.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_watch.subscribe()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().status.state
    }

    /// Session announced on the current or last link.
    #[must_use]
    pub fn session(&self) -> Option<SessionInfo> {
        self.session.read().clone()
    }

    /// Wait until the state leaves Connecting/Reconnecting.
    ///
    /// Returns the settled status (Connected, Error or Disconnected).
    pub async fn settled(&self) -> ConnectionStatus {
        let mut rx = self.watch_status();
        loop {
            let status = rx.borrow_and_update().clone();
            if !matches!(status.state, ConnectionState::Connecting | ConnectionState::Reconnecting) {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    // =========================================================================
    // Driver
    // =========================================================================

    async fn drive(self: Arc<Self>, credential: Credential, cancel: CancellationToken, generation: u64) {
        let mut backoff = BackoffPolicy::new(self.backoff.clone());

        loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => return,
                opened = self.transport.open(&credential) => opened,
            };

            let failure = match opened {
                Ok(link) => match self.run_link(link, &cancel, generation).await {
                    Some(loss) => {
                        // Only a link that reached Connected clears the failure count.
                        if loss.was_connected {
                            backoff.reset();
                        }
                        loss.reason
                    }
                    None => return,
                },
                Err(error) if error.is_auth_failure() => {
                    tracing::error!(error = %error, "Authentication failed");
                    self.transition(
                        generation,
                        ConnectionStatus::error(ConnectionErrorReason::AuthenticationFailed, backoff.failures(), error.to_string()),
                    );
                    return;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Connection attempt failed");
                    error.to_string()
                }
            };

            let Some(delay) = backoff.record_failure() else {
                tracing::error!(attempts = backoff.failures(), "Reconnection attempts exhausted");
                self.transition(
                    generation,
                    ConnectionStatus::error(ConnectionErrorReason::RetriesExhausted, backoff.failures(), failure),
                );
                return;
            };

            tracing::info!(
                attempt = backoff.failures(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to monitoring server"
            );
            metrics::record_reconnect();
            if !self.transition(generation, ConnectionStatus::reconnecting(backoff.failures(), delay, failure)) {
                return;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Reconnect cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one link until it closes. Returns how it ended, or `None` when
    /// cancelled.
    async fn run_link(&self, link: TransportLink, cancel: &CancellationToken, generation: u64) -> Option<LinkLoss> {
        let TransportLink { requester, mut events } = link;

        let link_id = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                requester.close();
                return None;
            }
            let link_id = self.registry.attach(Arc::clone(&requester));
            inner.link_id = Some(link_id);
            link_id
        };
        tracing::debug!(link_id, "Link open, replaying subscriptions");

        let replay = self.registry.replay_all();
        tokio::pin!(replay);
        let mut replayed = false;

        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    requester.close();
                    self.registry.detach(link_id);
                    return None;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Push(event)) => self.handle_push(event),
                    Some(TransportEvent::Closed { reason }) => break reason,
                    None => break "event stream ended".to_string(),
                },
                report = &mut replay, if !replayed => {
                    replayed = true;
                    if !report.is_complete() {
                        tracing::warn!(failed = report.failed.len(), "Some subscriptions were not replayed");
                    }
                    tracing::info!(subscriptions = report.replayed.len(), "Connected to monitoring server");
                    self.transition(generation, ConnectionStatus::new(ConnectionState::Connected));
                }
            }
        };

        tracing::warn!(reason = %reason, "Link lost");
        requester.close();
        {
            let mut inner = self.inner.lock();
            if inner.link_id == Some(link_id) {
                inner.link_id = None;
            }
        }
        self.registry.detach(link_id);
        Some(LinkLoss {
            reason,
            was_connected: replayed,
        })
    }

    fn handle_push(&self, event: PushEvent) {
        if let PushEvent::Connected(session) = &event {
            tracing::info!(user_id = %session.user_id, username = %session.username, "Session started");
            *self.session.write() = Some(session.clone());
        }
        self.dispatcher.dispatch(event);
    }

    /// Apply a status from the driver of `generation`. Stale drivers are ignored.
    fn transition(&self, generation: u64, status: ConnectionStatus) -> bool {
        let _order = self.publish_order.lock();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return false;
            }
            if status.state == ConnectionState::Error {
                inner.run = None;
            }
            inner.status = status.clone();
        }
        self.publish(&status);
        true
    }

    fn publish(&self, status: &ConnectionStatus) {
        tracing::debug!(state = %status.state, attempt = status.attempt, "Connection state changed");
        metrics::set_connection_state(status.state);
        self.status_watch.send_replace(status.clone());
        let _ = self.status_tx.send(status.clone());

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks.iter() {
            callback(status);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::TransportError;
    use crate::application::services::batch_assembly::BatchAssemblyService;
    use crate::application::services::test_support::FakeTransport;
    use crate::domain::batch::ReassemblyConfig;
    use chrono::Utc;
    use std::time::Duration;

    struct Harness {
        manager: Arc<ConnectionManager>,
        transport: Arc<FakeTransport>,
        registry: Arc<SubscriptionRegistry>,
        states: Arc<Mutex<Vec<ConnectionStatus>>>,
    }

    fn harness(max_attempts: u32) -> Harness {
        let transport = FakeTransport::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let batches = Arc::new(BatchAssemblyService::new(ReassemblyConfig::default(), Duration::from_secs(5)));
        let dispatcher = Arc::new(EventDispatcher::new(batches));
        let manager = Arc::new(ConnectionManager::new(
            transport.clone(),
            Arc::clone(&registry),
            dispatcher,
            BackoffConfig {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts,
            },
            16,
        ));
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        manager.on_status_change(move |status| sink.lock().push(status.clone()));
        Harness {
            manager,
            transport,
            registry,
            states,
        }
    }

    fn credential() -> Credential {
        Credential::new("token")
    }

    fn states(h: &Harness) -> Vec<ConnectionState> {
        h.states.lock().iter().map(|status| status.state).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_reports_connected() {
        let h = harness(0);
        h.transport.script(Ok(()));

        assert!(h.manager.connect(credential()));
        let status = h.manager.settled().await;

        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(states(&h), vec![ConnectionState::Connecting, ConnectionState::Connected]);
        assert!(h.registry.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_live() {
        let h = harness(0);
        h.transport.script(Ok(()));

        assert!(h.manager.connect(credential()));
        assert!(!h.manager.connect(credential()));
        h.manager.settled().await;
        assert!(!h.manager.connect(credential()));

        assert_eq!(h.transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_replayed_before_connected_is_announced() {
        let h = harness(0);
        h.registry.subscribe("pump-1").await.unwrap();
        h.registry.subscribe("pump-2").await.unwrap();
        h.transport.script(Ok(()));

        let transport = Arc::clone(&h.transport);
        let seen_at_connect = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&seen_at_connect);
        h.manager.on_status_change(move |status| {
            if status.state == ConnectionState::Connected {
                *seen.lock() = transport.requester().map(|r| r.subscribed_ids().len());
            }
        });

        h.manager.connect(credential());
        h.manager.settled().await;

        assert_eq!(*seen_at_connect.lock(), Some(2));
        assert_eq!(h.registry.confirmed_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_terminal() {
        let h = harness(0);
        h.transport.script(Err(TransportError::Unauthorized("token expired".into())));

        h.manager.connect(credential());
        let status = h.manager.settled().await;

        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.reason, Some(ConnectionErrorReason::AuthenticationFailed));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_ends_in_error_until_explicit_connect() {
        let h = harness(3);

        h.manager.connect(credential());
        let status = h.manager.settled().await;

        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.reason, Some(ConnectionErrorReason::RetriesExhausted));
        assert_eq!(h.transport.opens(), 3);
        assert_eq!(
            states(&h),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Error,
            ]
        );

        h.transport.script(Ok(()));
        assert!(h.manager.connect(credential()));
        assert_eq!(h.manager.settled().await.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_attempt_waits_for_backoff_after_three_failures() {
        let h = harness(0);
        for _ in 0..3 {
            h.transport.script(Err(TransportError::ConnectFailed("refused".into())));
        }
        h.transport.script(Ok(()));

        let started = tokio::time::Instant::now();
        h.manager.connect(credential());
        h.manager.settled().await;

        let delays: Vec<Duration> = h.states.lock().iter().filter_map(|status| status.next_retry).collect();
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]);
        assert!(started.elapsed() >= Duration::from_secs(14));
        assert_eq!(h.transport.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn links_lost_before_replay_count_towards_the_retry_limit() {
        let h = harness(3);
        h.registry.subscribe("pump-1").await.unwrap();
        h.transport.flap();

        h.manager.connect(credential());
        let status = h.manager.settled().await;

        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.reason, Some(ConnectionErrorReason::RetriesExhausted));
        assert_eq!(h.transport.opens(), 3);
        let delays: Vec<Duration> = h.states.lock().iter().filter_map(|status| status.next_retry).collect();
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_shutdown_is_refused() {
        let h = harness(0);
        h.transport.script(Ok(()));

        h.manager.shutdown();

        assert!(!h.manager.connect(credential()));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.transport.opens(), 0);
        assert!(states(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_reconnects_and_replays() {
        let h = harness(0);
        h.registry.subscribe("pump-1").await.unwrap();
        h.transport.script(Ok(()));
        h.transport.script(Ok(()));

        h.manager.connect(credential());
        h.manager.settled().await;
        h.transport.drop_link("ping timeout").await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
        assert_eq!(h.registry.confirmed_count(), 0);

        assert_eq!(h.manager.settled().await.state, ConnectionState::Connected);
        let requesters = h.transport.requesters();
        assert_eq!(requesters.len(), 2);
        assert!(requesters[0].is_closed());
        assert_eq!(requesters[1].subscribed_ids(), vec!["pump-1"]);
        assert_eq!(h.registry.confirmed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let h = harness(0);

        h.manager.connect(credential());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        h.manager.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connected_closes_link() {
        let h = harness(0);
        h.transport.script(Ok(()));
        h.manager.connect(credential());
        h.manager.settled().await;

        h.manager.disconnect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(!h.registry.is_attached());
        assert!(h.transport.requester().unwrap().is_closed());
        h.manager.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn session_info_is_recorded() {
        let h = harness(0);
        h.transport.script(Ok(()));
        h.manager.connect(credential());
        h.manager.settled().await;

        h.transport
            .push(PushEvent::Connected(SessionInfo {
                user_id: "u-7".into(),
                username: "chief".into(),
                timestamp: Utc::now(),
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.manager.session().map(|s| s.username), Some("chief".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn status_stream_sees_every_change() {
        let h = harness(0);
        let mut stream = h.manager.subscribe_status();
        h.transport.script(Ok(()));

        h.manager.connect(credential());
        h.manager.settled().await;

        assert_eq!(stream.recv().await.unwrap().state, ConnectionState::Connecting);
        assert_eq!(stream.recv().await.unwrap().state, ConnectionState::Connected);
    }
}
