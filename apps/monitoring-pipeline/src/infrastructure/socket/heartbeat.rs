//! Link Heartbeat
//!
//! Keeps the push link honest with application-level `ping` requests. The
//! link task sends a ping on every [`HeartbeatEvent::SendPing`] and reports
//! each `pong` acknowledgment to [`HeartbeatState`]; when no pong arrives
//! within the timeout the manager emits [`HeartbeatEvent::Timeout`] and the
//! link is closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long an unanswered ping may stay outstanding.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// The last ping went unanswered for too long.
    Timeout,
}

/// Pong bookkeeping shared between the manager and the link task.
#[derive(Debug)]
pub struct HeartbeatState {
    last_pong: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Fresh state; the link counts as just answered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_pong: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// Record a pong.
    pub fn record_pong(&self) {
        *self.last_pong.write() = Instant::now();
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// Record that a ping went out.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Whether a ping is unanswered.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the last pong.
    #[must_use]
    pub fn time_since_pong(&self) -> Duration {
        self.last_pong.read().elapsed()
    }
}

/// Drives the ping schedule for one link.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, a timeout is reported, or the link task goes away.
    pub async fn run(self) {
        let start = Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Heartbeat stopped");
    }

    async fn tick(&self) -> bool {
        if self.state.is_waiting_for_pong() {
            let elapsed = self.state.time_since_pong();
            if elapsed > self.config.pong_timeout {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs(),
                    timeout_secs = self.config.pong_timeout.as_secs(),
                    "Heartbeat timeout"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return false;
            }
        }
        self.event_tx.send(HeartbeatEvent::SendPing).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn pong_clears_waiting_flag() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        assert!(state.is_waiting_for_pong());

        state.record_pong();
        assert!(!state.is_waiting_for_pong());
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_interval() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_secs(25), Duration::from_secs(60)),
            Arc::clone(&state),
            event_tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());

        let started = Instant::now();
        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert!(started.elapsed() >= Duration::from_secs(25));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_times_out() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_secs(25), Duration::from_secs(60)),
            Arc::clone(&state),
            event_tx,
            CancellationToken::new(),
        );
        let handle = tokio::spawn(manager.run());

        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            if event == HeartbeatEvent::SendPing {
                state.mark_ping_sent();
            }
            events.push(event);
        }

        assert_eq!(events.last(), Some(&HeartbeatEvent::Timeout));
        assert!(events.iter().filter(|e| **e == HeartbeatEvent::SendPing).count() >= 2);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_link_alive() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_secs(25), Duration::from_secs(60)),
            Arc::clone(&state),
            event_tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());

        for _ in 0..6 {
            assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendPing));
            state.mark_ping_sent();
            state.record_pong();
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
