//! Push Link Integration Tests
//!
//! Runs the assembled pipeline against a local WebSocket server speaking the
//! monitoring protocol and a mocked alarm action API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, StatusCode};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use monitoring_pipeline::application::ports::{AlarmActionPort, Credential, TransportPort};
use monitoring_pipeline::domain::connection::{BackoffConfig, ConnectionErrorReason};
use monitoring_pipeline::{
    AlarmApiClient, AlarmApiConfig, AlarmStatus, ConnectionState, Pipeline, PipelineSettings,
    WebSocketConfig, WebSocketTransport,
};

const TOKEN: &str = "deck-officer-token";

// =============================================================================
// Local push server
// =============================================================================

#[derive(Clone, Default)]
struct ServerLog {
    auth_headers: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    connections: Arc<AtomicUsize>,
}

struct PushServer {
    url: String,
    log: ServerLog,
}

impl PushServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = ServerLog::default();

        let accept_log = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_log.clone()));
            }
        });

        Self {
            url: format!("ws://{addr}"),
            log,
        }
    }

    fn push(&self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.send(Message::text(frame));
    }

    fn drop_link(&self) {
        self.send(Message::Close(None));
    }

    fn send(&self, message: Message) {
        let sender = self.log.outbound.lock().clone();
        sender.expect("no client connected").send(message).unwrap();
    }

    fn subscribe_requests(&self, equipment_id: &str) -> usize {
        self.log
            .requests
            .lock()
            .iter()
            .filter(|frame| {
                frame["event"] == "subscribe:equipment" && frame["data"]["equipmentId"] == equipment_id
            })
            .count()
    }

    fn connections(&self) -> usize {
        self.log.connections.load(Ordering::SeqCst)
    }
}

async fn serve(stream: TcpStream, log: ServerLog) {
    let auth_headers = Arc::clone(&log.auth_headers);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let value = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        auth_headers.lock().push(value.clone());
        if value == format!("Bearer {TOKEN}") {
            Ok(response)
        } else {
            Err(http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Some("invalid token".to_string()))
                .unwrap())
        }
    };

    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    log.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    *log.outbound.lock() = Some(tx);

    let hello = json!({
        "event": "connected",
        "data": { "userId": "u-1", "username": "chief", "timestamp": "2026-03-01T10:00:00Z" }
    });
    if write.send(Message::text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let id = frame["id"].as_u64();
                    let room = frame["data"]["equipmentId"].as_str().map(|e| format!("equipment:{e}"));
                    log.requests.lock().push(frame);
                    if let Some(id) = id {
                        let ack = json!({ "ack": id, "data": { "success": true, "room": room } });
                        if write.send(Message::text(ack.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if write.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn pipeline(server: &PushServer, api: &MockServer) -> Arc<Pipeline> {
    let settings = PipelineSettings {
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            jitter_factor: 0.0,
            ..BackoffConfig::default()
        },
        ..PipelineSettings::default()
    };
    let ws = WebSocketConfig {
        handshake_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..WebSocketConfig::new(server.url.clone())
    };
    let transport: Arc<dyn TransportPort> = Arc::new(WebSocketTransport::new(ws));
    let actions: Arc<dyn AlarmActionPort> = Arc::new(
        AlarmApiClient::new(AlarmApiConfig {
            base_url: api.uri(),
            credential: Credential::new(TOKEN),
            timeout: Duration::from_secs(2),
        })
        .unwrap(),
    );
    Arc::new(Pipeline::new(&settings, transport, actions))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn pipeline_follows_equipment_end_to_end() {
    let server = PushServer::start().await;
    let api = MockServer::start().await;
    let pipeline = pipeline(&server, &api);

    pipeline.init();
    assert!(pipeline.connect(Credential::new(TOKEN)));
    assert_eq!(pipeline.connection().settled().await.state, ConnectionState::Connected);
    assert_eq!(server.log.auth_headers.lock().as_slice(), [format!("Bearer {TOKEN}")]);

    assert!(pipeline.subscribe("pump-1").await.unwrap());
    assert_eq!(server.subscribe_requests("pump-1"), 1);
    assert!(pipeline.registry().is_active("pump-1"));

    server.push(
        "alarm:push",
        json!({
            "id": "a-1", "equipmentId": "pump-1", "severity": "critical",
            "triggeredAt": "2026-03-01T10:00:00Z", "faultName": "Bearing overheat"
        }),
    );
    eventually("critical alarm", || pipeline.alarms().get("a-1").is_some()).await;
    let alarm = pipeline.alarms().get("a-1").unwrap();
    assert_eq!(alarm.status, AlarmStatus::Pending);
    assert!(alarm.emergency);

    server.push(
        "monitoring:batch-data",
        json!({
            "batchId": "b-1", "equipmentId": "pump-1", "chunkIndex": 2, "totalChunks": 2,
            "data": [{ "equipmentId": "pump-1", "timestamp": "2026-03-01T10:00:02Z",
                       "metricType": "vibration", "value": 4.2 }]
        }),
    );
    server.push(
        "monitoring:batch-data",
        json!({
            "batchId": "b-1", "equipmentId": "pump-1", "chunkIndex": 1, "totalChunks": 2,
            "data": [{ "equipmentId": "pump-1", "timestamp": "2026-03-01T10:00:01Z",
                       "metricType": "temperature", "value": 71.5 }]
        }),
    );
    eventually("reassembled batch", || pipeline.monitoring().latest("pump-1").len() == 2).await;
    assert_eq!(pipeline.batches().stats().completed, 1);
    assert_eq!(pipeline.batches().stats().pending, 0);

    Mock::given(method("POST"))
        .and(path("/alarms/a-1/acknowledge"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "a-1", "status": "processing", "handler": "chief" }
        })))
        .expect(1)
        .mount(&api)
        .await;

    pipeline.alarms().acknowledge("a-1", Some("crew dispatched")).await.unwrap();

    let alarm = pipeline.alarms().get("a-1").unwrap();
    assert_eq!(alarm.status, AlarmStatus::Processing);
    assert_eq!(alarm.handler.as_deref(), Some("chief"));
    assert!(!alarm.emergency);

    pipeline.teardown().await;
}

#[tokio::test]
async fn rejected_token_is_terminal() {
    let server = PushServer::start().await;
    let api = MockServer::start().await;
    let pipeline = pipeline(&server, &api);

    assert!(pipeline.connect(Credential::new("stale-token")));
    let status = pipeline.connection().settled().await;

    assert_eq!(status.state, ConnectionState::Error);
    assert_eq!(status.reason, Some(ConnectionErrorReason::AuthenticationFailed));
    assert_eq!(server.connections(), 0);
    assert_eq!(server.log.auth_headers.lock().len(), 1);

    pipeline.teardown().await;
}

#[tokio::test]
async fn subscriptions_are_replayed_after_link_loss() {
    let server = PushServer::start().await;
    let api = MockServer::start().await;
    let pipeline = pipeline(&server, &api);

    pipeline.connect(Credential::new(TOKEN));
    assert_eq!(pipeline.connection().settled().await.state, ConnectionState::Connected);
    assert!(pipeline.subscribe("pump-1").await.unwrap());
    assert!(pipeline.subscribe("fan-2").await.unwrap());

    server.drop_link();

    eventually("second connection", || server.connections() == 2).await;
    eventually("replayed subscriptions", || {
        server.subscribe_requests("pump-1") == 2 && server.subscribe_requests("fan-2") == 2
    })
    .await;
    eventually("connected again", || {
        pipeline.connection().state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(pipeline.registry().confirmed_count(), 2);

    pipeline.teardown().await;
}

#[tokio::test]
async fn subscribe_while_disconnected_is_replayed_on_connect() {
    let server = PushServer::start().await;
    let api = MockServer::start().await;
    let pipeline = pipeline(&server, &api);

    assert!(!pipeline.subscribe("winch-3").await.unwrap());
    assert_eq!(server.subscribe_requests("winch-3"), 0);

    pipeline.connect(Credential::new(TOKEN));
    assert_eq!(pipeline.connection().settled().await.state, ConnectionState::Connected);
    eventually("queued subscription", || server.subscribe_requests("winch-3") == 1).await;

    pipeline.teardown().await;
}
