//! Bulk Alarm Action Integration Tests
//!
//! Drives bulk operations through the alarm engine and the REST client
//! against a mocked action API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use monitoring_pipeline::application::ports::{AlarmActionPort, Credential, TransportPort};
use monitoring_pipeline::domain::bulk::FailureReason;
use monitoring_pipeline::{
    Alarm, AlarmAction, AlarmApiClient, AlarmApiConfig, AlarmSeverity, AlarmStatus, BulkStatus,
    BulkStrategy, Pipeline, PipelineSettings, WebSocketConfig, WebSocketTransport,
};

fn pipeline(api: &MockServer) -> Pipeline {
    // The push link is never opened in these tests.
    let transport: Arc<dyn TransportPort> = Arc::new(WebSocketTransport::new(
        WebSocketConfig::new("ws://127.0.0.1:9"),
    ));
    let actions: Arc<dyn AlarmActionPort> = Arc::new(
        AlarmApiClient::new(AlarmApiConfig {
            base_url: api.uri(),
            credential: Credential::new("token"),
            timeout: Duration::from_secs(2),
        })
        .unwrap(),
    );
    Pipeline::new(&PipelineSettings::default(), transport, actions)
}

fn alarm(id: &str, severity: AlarmSeverity, minute: u32) -> Alarm {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, minute, 0).unwrap();
    Alarm::new(id, "pump-1", severity, at)
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|id| (*id).to_string()).collect()
}

#[tokio::test]
async fn bulk_resolve_is_best_effort() {
    let api = MockServer::start().await;
    let pipeline = pipeline(&api);
    for (id, minute) in [("a", 1), ("b", 2), ("c", 3)] {
        pipeline.alarms().upsert(alarm(id, AlarmSeverity::Medium, minute));
    }

    Mock::given(method("POST"))
        .and(path("/alarms/b/resolve"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "locked by bridge" })))
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "note": "shift handover" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "resolved" })))
        .expect(2)
        .mount(&api)
        .await;

    let status = pipeline
        .bulk()
        .bulk_apply(&ids(&["a", "b", "c", "a"]), AlarmAction::Resolve, Some("shift handover"))
        .await
        .unwrap();

    assert_eq!(status.status, BulkStatus::Completed);
    assert_eq!(status.total_items, 3);
    assert_eq!(status.processed_items, 2);
    assert_eq!(status.failed_items.len(), 1);
    assert_eq!(status.failed_items[0].id, "b");
    assert_eq!(
        status.failed_items[0].reason,
        FailureReason::Rejected {
            message: "locked by bridge".to_string()
        }
    );

    assert_eq!(pipeline.alarms().get("a").unwrap().status, AlarmStatus::Resolved);
    assert_eq!(pipeline.alarms().get("b").unwrap().status, AlarmStatus::Pending);
    assert_eq!(pipeline.alarms().get("c").unwrap().status, AlarmStatus::Resolved);

    let progress = pipeline.bulk().progress().borrow().clone().unwrap();
    assert_eq!(progress.operation_id, status.operation_id);
}

#[tokio::test]
async fn bulk_ignore_requires_a_reason() {
    let api = MockServer::start().await;
    let pipeline = pipeline(&api);
    pipeline.alarms().upsert(alarm("a", AlarmSeverity::Low, 1));

    let result = pipeline
        .bulk()
        .bulk_apply(&ids(&["a"]), AlarmAction::Ignore, None)
        .await;

    assert!(result.is_err());
    let progress = pipeline.bulk().progress().borrow().clone().unwrap();
    assert_eq!(progress.status, BulkStatus::Failed);
    assert_eq!(pipeline.alarms().get("a").unwrap().status, AlarmStatus::Pending);
    assert!(api.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn smart_process_holds_back_low_confidence() {
    let api = MockServer::start().await;
    let pipeline = pipeline(&api);
    pipeline.alarms().upsert(alarm("sure", AlarmSeverity::High, 1));
    pipeline.alarms().upsert(alarm("unsure", AlarmSeverity::Low, 2));

    Mock::given(method("POST"))
        .and(path("/alarms/sure/classify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "category": "sensor_drift", "confidence": 0.93, "suggestedAction": "acknowledge"
        })))
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .and(path("/alarms/unsure/classify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "category": "unknown", "confidence": 0.4
        })))
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .and(path("/alarms/sure/acknowledge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "processing" })))
        .expect(1)
        .mount(&api)
        .await;

    let status = pipeline
        .bulk()
        .smart_bulk_process(
            &ids(&["unsure", "sure"]),
            BulkStrategy::Auto,
            0.8,
            AlarmAction::Resolve,
            Some("auto triage"),
        )
        .await
        .unwrap();

    assert_eq!(status.status, BulkStatus::Completed);
    assert_eq!(status.processed_items, 1);
    assert_eq!(status.failed_items.len(), 1);
    assert_eq!(status.failed_items[0].id, "unsure");
    assert!(matches!(
        status.failed_items[0].reason,
        FailureReason::LowConfidence { threshold, .. } if (threshold - 0.8).abs() < f64::EPSILON
    ));

    assert_eq!(pipeline.alarms().get("sure").unwrap().status, AlarmStatus::Processing);
    assert_eq!(pipeline.alarms().get("unsure").unwrap().status, AlarmStatus::Pending);
}
