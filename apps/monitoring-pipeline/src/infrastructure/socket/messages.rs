//! Push Link Message Types
//!
//! Wire format types for frames exchanged with the monitoring server.
//! Field names are camelCase on the wire.
//!
//! # Frames
//!
//! ```json
//! {"event": "alarm:push", "data": {...}}
//! {"event": "subscribe:equipment", "data": {"equipmentId": "pump-1"}, "id": 7}
//! {"ack": 7, "data": {"success": true, "room": "equipment:pump-1"}}
//! ```
//!
//! # Push Events
//!
//! - `connected`: session handshake
//! - `alarm:push` / `alarm:batch`: alarms
//! - `monitoring:new-data`: a live reading
//! - `monitoring:batch-data`: one chunk of a chunked transfer
//! - `equipment:health:update` / `equipment:health:warning`: health scores
//! - `disconnect` / `connect_error`: server-side link termination

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::monitoring::{DataQuality, HealthTrend};

// =============================================================================
// Envelopes
// =============================================================================

/// Any inbound frame, before it is classified as an event or an ack.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    /// Event name, for pushes.
    #[serde(default)]
    pub event: Option<String>,

    /// Request id being acknowledged, for acks.
    #[serde(default)]
    pub ack: Option<u64>,

    /// Payload.
    #[serde(default)]
    pub data: Value,
}

/// Outbound request frame.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame<'a> {
    /// Event name.
    pub event: &'a str,
    /// Payload.
    pub data: Value,
    /// Correlation id echoed in the ack.
    pub id: u64,
}

// =============================================================================
// Session
// =============================================================================

/// `connected` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    /// User id.
    pub user_id: String,
    /// Display name; used as the default alarm handler.
    pub username: String,
    /// Server time of the handshake.
    pub timestamp: DateTime<Utc>,
}

/// `connect_error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectErrorMessage {
    /// Error text. Some servers send `message` instead.
    #[serde(alias = "message", default)]
    pub error: String,
    /// Error code, string or number on the wire.
    #[serde(default, deserialize_with = "code_as_string")]
    pub code: Option<String>,
}

/// `disconnect` payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct DisconnectMessage {
    /// Reason given by the server.
    #[serde(default)]
    pub reason: String,
}

// =============================================================================
// Alarms
// =============================================================================

/// `alarm:push` payload.
///
/// Severity and status stay strings here; the codec maps them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmMessage {
    /// Alarm id.
    pub id: String,
    /// Equipment id.
    pub equipment_id: String,
    /// Severity in any accepted spelling.
    pub severity: String,
    /// Status in any accepted spelling.
    #[serde(default = "pending")]
    pub status: String,
    /// When the fault was detected.
    pub triggered_at: DateTime<Utc>,
    /// Monitoring point.
    #[serde(default)]
    pub monitoring_point: Option<String>,
    /// Fault name.
    #[serde(default)]
    pub fault_name: Option<String>,
    /// Recommended action.
    #[serde(default)]
    pub recommended_action: Option<String>,
    /// Handler.
    #[serde(default)]
    pub handler: Option<String>,
    /// When it was handled.
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
    /// Handler note.
    #[serde(default)]
    pub handle_note: Option<String>,
    /// Replayed from the server buffer.
    #[serde(default)]
    pub buffered: bool,
}

/// `alarm:batch` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlarmBatchMessage {
    /// Alarms.
    pub alarms: Vec<AlarmMessage>,
    /// Count as reported by the server.
    #[serde(default)]
    pub count: Option<usize>,
}

// =============================================================================
// Monitoring
// =============================================================================

/// `monitoring:new-data` payload and the element type of batch data.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPointMessage {
    /// Equipment id.
    pub equipment_id: String,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Metric type.
    pub metric_type: String,
    /// Monitoring point.
    #[serde(default)]
    pub monitoring_point: String,
    /// Value.
    pub value: f64,
    /// Unit.
    #[serde(default)]
    pub unit: String,
    /// Signal quality.
    #[serde(default = "unknown_quality")]
    pub quality: DataQuality,
    /// Producer.
    #[serde(default)]
    pub source: String,
}

/// `monitoring:batch-data` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDataMessage {
    /// Transfer id.
    pub batch_id: String,
    /// Equipment id.
    pub equipment_id: String,
    /// Points in this chunk.
    #[serde(default)]
    pub data: Vec<DataPointMessage>,
    /// 1-based chunk index.
    pub chunk_index: u32,
    /// Chunks in the transfer.
    pub total_chunks: u32,
    /// Historical backfill.
    #[serde(default)]
    pub is_history: bool,
}

/// `equipment:health:*` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMessage {
    /// Equipment id.
    pub equipment_id: String,
    /// Health score.
    pub score: f64,
    /// Letter grade.
    #[serde(default)]
    pub grade: String,
    /// State of health.
    #[serde(default)]
    pub soh: f64,
    /// Trend.
    #[serde(default = "unknown_trend")]
    pub trend: HealthTrend,
    /// When it was computed.
    pub calculated_at: DateTime<Utc>,
}

fn pending() -> String {
    "pending".to_string()
}

const fn unknown_quality() -> DataQuality {
    DataQuality::Unknown
}

const fn unknown_trend() -> HealthTrend {
    HealthTrend::Unknown
}

fn code_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(code)) => Some(code),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_message_defaults() {
        let json = r#"{
            "id": "a-1",
            "equipmentId": "pump-1",
            "severity": "critical",
            "triggeredAt": "2026-03-01T10:00:00Z"
        }"#;

        let alarm: AlarmMessage = serde_json::from_str(json).unwrap();

        assert_eq!(alarm.status, "pending");
        assert!(!alarm.buffered);
        assert!(alarm.handler.is_none());
    }

    #[test]
    fn connect_error_accepts_numeric_code_and_message_alias() {
        let json = r#"{"message": "token expired", "code": 401}"#;

        let error: ConnectErrorMessage = serde_json::from_str(json).unwrap();

        assert_eq!(error.error, "token expired");
        assert_eq!(error.code.as_deref(), Some("401"));
    }

    #[test]
    fn unknown_quality_is_tolerated() {
        let json = r#"{
            "equipmentId": "pump-1",
            "timestamp": "2026-03-01T10:00:00Z",
            "metricType": "vibration",
            "value": 3.2,
            "quality": "interpolated"
        }"#;

        let point: DataPointMessage = serde_json::from_str(json).unwrap();

        assert_eq!(point.quality, DataQuality::Unknown);
        assert_eq!(point.monitoring_point, "");
    }

    #[test]
    fn request_frame_shape() {
        let frame = RequestFrame {
            event: "ping",
            data: serde_json::json!({}),
            id: 3,
        };

        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            serde_json::json!({"event": "ping", "data": {}, "id": 3})
        );
    }
}
