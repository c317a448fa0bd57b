//! WebSocket Push Transport
//!
//! [`TransportPort`] over a WebSocket carrying JSON frames.
//!
//! Opening a link:
//!
//! 1. Upgrade with `Authorization: Bearer <token>`. A 401/403 answer is an
//!    authentication failure.
//! 2. Wait for the `connected` handshake event; `connect_error` fails the
//!    open.
//! 3. Spawn the link task, which owns the socket: it forwards pushes in
//!    order, matches acks to outstanding requests, and runs the heartbeat.
//!
//! When the link ends every outstanding request fails with
//! [`TransportError::Closed`] and a final [`TransportEvent::Closed`] is sent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, FrameCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use crate::application::ports::{
    Credential, OutboundRequest, RequestAck, RequestPort, TransportError, TransportEvent, TransportLink,
    TransportPort,
};
use crate::domain::events::PushEvent;
use crate::infrastructure::metrics;

/// Error codes in `connect_error` that mean the credential was refused.
const AUTH_ERROR_CODES: &[&str] = &["401", "403", "unauthorized", "forbidden", "auth_failed", "invalid_token", "token_expired"];

// =============================================================================
// Configuration
// =============================================================================

/// Settings for the WebSocket transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Push endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// How long a request waits for its ack.
    pub request_timeout: Duration,
    /// How long to wait for the `connected` handshake.
    pub handshake_timeout: Duration,
    /// Inbound event buffer per link.
    pub event_buffer: usize,
}

impl WebSocketConfig {
    /// Configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: HeartbeatConfig::default(),
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 1024,
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// WebSocket implementation of [`TransportPort`].
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
    codec: FrameCodec,
}

impl WebSocketTransport {
    /// Create a transport.
    #[must_use]
    pub const fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            codec: FrameCodec::new(),
        }
    }

    async fn await_handshake<S>(&self, read: &mut S) -> Result<PushEvent, TransportError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match self.codec.decode(text.as_str()) {
                    Ok(Frame::Event(event @ PushEvent::Connected(_))) => return Ok(event),
                    Ok(Frame::Event(PushEvent::ConnectError { error, code })) => {
                        return Err(connect_error(error, code.as_deref()));
                    }
                    Ok(frame) => {
                        tracing::debug!(?frame, "Frame before handshake ignored");
                    }
                    Err(error) => {
                        metrics::record_protocol_anomaly(error.kind());
                        tracing::warn!(error = %error, "Undecodable frame during handshake");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::ConnectFailed("closed during handshake".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(TransportError::ConnectFailed(error.to_string())),
            }
        }
    }
}

#[async_trait]
impl TransportPort for WebSocketTransport {
    async fn open(&self, credential: &Credential) -> Result<TransportLink, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|_| TransportError::Unauthorized("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::info!(url = %self.config.url, "Opening push link");
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(upgrade_error)?;
        let (write, mut read) = socket.split();

        let session = tokio::time::timeout(self.config.handshake_timeout, self.await_handshake(&mut read))
            .await
            .map_err(|_| TransportError::ConnectFailed("handshake timed out".into()))??;

        let (event_tx, events) = mpsc::channel(self.config.event_buffer.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let shared = Arc::new(LinkShared::default());

        // The handshake event carries the session; deliver it first.
        let _ = event_tx.send(TransportEvent::Push(session)).await;

        let task = LinkTask {
            codec: self.codec.clone(),
            shared: Arc::clone(&shared),
            heartbeat: self.config.heartbeat,
            event_tx,
            outbound_rx,
        };
        tokio::spawn(task.run(write, read));

        let requester = WebSocketRequester {
            codec: self.codec.clone(),
            shared,
            outbound_tx,
            timeout: self.config.request_timeout,
        };
        Ok(TransportLink {
            requester: Arc::new(requester),
            events,
        })
    }
}

// =============================================================================
// Requester
// =============================================================================

type PendingAck = oneshot::Sender<Result<RequestAck, TransportError>>;

#[derive(Default)]
struct LinkShared {
    pending: Mutex<HashMap<u64, PendingAck>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl LinkShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<PendingAck> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

struct WebSocketRequester {
    codec: FrameCodec,
    shared: Arc<LinkShared>,
    outbound_tx: mpsc::Sender<String>,
    timeout: Duration,
}

#[async_trait]
impl RequestPort for WebSocketRequester {
    async fn request(&self, request: OutboundRequest) -> Result<RequestAck, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = self.shared.next_id();
        let text = self
            .codec
            .encode_request(id, &request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let started = Instant::now();
        if self.outbound_tx.send(text).await.is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        let result = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        };
        metrics::record_request_duration(request.event_name(), started.elapsed());
        result
    }

    fn close(&self) {
        self.shared.cancel.cancel();
    }
}

// =============================================================================
// Link task
// =============================================================================

struct LinkTask {
    codec: FrameCodec,
    shared: Arc<LinkShared>,
    heartbeat: HeartbeatConfig,
    event_tx: mpsc::Sender<TransportEvent>,
    outbound_rx: mpsc::Receiver<String>,
}

impl LinkTask {
    async fn run<W, R>(mut self, mut write: W, mut read: R)
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        let heartbeat_cancel = self.shared.cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                self.heartbeat,
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );
        let mut ping_ids = HashSet::new();
        let cancel = self.shared.cancel.clone();

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break "closed by client".to_string();
                }
                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => {
                        let id = self.shared.next_id();
                        match self.codec.encode_request(id, &OutboundRequest::Ping) {
                            Ok(text) => {
                                heartbeat_state.mark_ping_sent();
                                ping_ids.insert(id);
                                if let Err(error) = write.send(Message::Text(text.into())).await {
                                    break format!("send failed: {error}");
                                }
                            }
                            Err(error) => tracing::error!(error = %error, "Ping encode failed"),
                        }
                    }
                    HeartbeatEvent::Timeout => break "heartbeat timeout".to_string(),
                },
                Some(text) = self.outbound_rx.recv() => {
                    if let Err(error) = write.send(Message::Text(text.into())).await {
                        break format!("send failed: {error}");
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = self.handle_text(text.as_str(), &mut ping_ids, &heartbeat_state).await {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(error) = write.send(Message::Pong(data)).await {
                            break format!("send failed: {error}");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(|| "server closed the link".to_string(), |f| f.reason.as_str().to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => break error.to_string(),
                    None => break "stream ended".to_string(),
                },
            }
        };

        heartbeat_cancel.cancel();
        self.shared.fail_pending();
        tracing::info!(reason = %reason, "Push link closed");
        let _ = self.event_tx.send(TransportEvent::Closed { reason }).await;
    }

    /// Returns a close reason when the frame ends the link.
    async fn handle_text(&self, text: &str, ping_ids: &mut HashSet<u64>, heartbeat: &HeartbeatState) -> Option<String> {
        match self.codec.decode(text) {
            Ok(Frame::Ack { id, data }) => {
                if ping_ids.remove(&id) {
                    heartbeat.record_pong();
                } else if let Some(tx) = self.shared.pending.lock().remove(&id) {
                    let _ = tx.send(Ok(RequestAck::from_payload(data)));
                } else {
                    tracing::debug!(id, "Ack for unknown request");
                }
                None
            }
            Ok(Frame::Event(PushEvent::Disconnect { reason })) => Some(format!("server disconnect: {reason}")),
            Ok(Frame::Event(PushEvent::ConnectError { error, .. })) => Some(format!("connect error: {error}")),
            Ok(Frame::Event(event)) => {
                if self.event_tx.send(TransportEvent::Push(event)).await.is_err() {
                    return Some("event receiver dropped".to_string());
                }
                None
            }
            Err(error) => {
                metrics::record_protocol_anomaly(error.kind());
                tracing::warn!(error = %error, kind = error.kind(), "Dropped undecodable frame");
                None
            }
        }
    }
}

// =============================================================================
// Error mapping
// =============================================================================

fn upgrade_error(error: tungstenite::Error) -> TransportError {
    if let tungstenite::Error::Http(response) = &error {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return TransportError::Unauthorized(format!("upgrade rejected with {status}"));
        }
    }
    TransportError::ConnectFailed(error.to_string())
}

fn connect_error(error: String, code: Option<&str>) -> TransportError {
    let code_is_auth = code.is_some_and(|code| AUTH_ERROR_CODES.contains(&code.to_ascii_lowercase().as_str()));
    let lowered = error.to_ascii_lowercase();
    let message_is_auth = ["unauthorized", "authentication", "invalid token", "token expired", "forbidden"]
        .iter()
        .any(|needle| lowered.contains(needle));

    if code_is_auth || message_is_auth {
        TransportError::Unauthorized(error)
    } else {
        TransportError::ConnectFailed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_classification() {
        assert!(connect_error("nope".into(), Some("401")).is_auth_failure());
        assert!(connect_error("nope".into(), Some("TOKEN_EXPIRED")).is_auth_failure());
        assert!(connect_error("Authentication failed".into(), None).is_auth_failure());
        assert!(!connect_error("server overloaded".into(), Some("503")).is_auth_failure());
    }

    #[tokio::test]
    async fn closed_link_fails_pending_requests() {
        let shared = Arc::new(LinkShared::default());
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(1, tx);

        shared.fail_pending();

        assert_eq!(rx.await.unwrap(), Err(TransportError::Closed));
        assert!(shared.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn request_after_close_fails_fast() {
        let shared = Arc::new(LinkShared::default());
        shared.fail_pending();
        let (outbound_tx, _outbound_rx) = mpsc::channel(1);
        let requester = WebSocketRequester {
            codec: FrameCodec::new(),
            shared,
            outbound_tx,
            timeout: Duration::from_secs(1),
        };

        assert_eq!(requester.request(OutboundRequest::Ping).await, Err(TransportError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
        let requester = WebSocketRequester {
            codec: FrameCodec::new(),
            shared: Arc::new(LinkShared::default()),
            outbound_tx,
            timeout: Duration::from_secs(10),
        };

        let result = requester
            .request(OutboundRequest::Subscribe {
                equipment_id: "pump-1".into(),
            })
            .await;

        assert_eq!(result, Err(TransportError::Timeout));
        assert!(outbound_rx.recv().await.unwrap().contains("subscribe:equipment"));
        assert!(requester.shared.pending.lock().is_empty());
    }
}
