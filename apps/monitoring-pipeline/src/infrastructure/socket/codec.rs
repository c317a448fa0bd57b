//! Push Link Codec
//!
//! Decodes inbound JSON text frames into push events and acknowledgments,
//! and encodes outbound requests.
//!
//! Severity and status strings are mapped through one table in each
//! direction. Decoding accepts the server spellings and the legacy UI
//! spellings; encoding always produces the canonical form.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::messages::{
    AlarmBatchMessage, AlarmMessage, BatchDataMessage, ConnectErrorMessage, DataPointMessage,
    DisconnectMessage, HealthMessage, RawFrame, RequestFrame, SessionMessage,
};
use crate::application::ports::OutboundRequest;
use crate::domain::alarm::{Alarm, AlarmSeverity, AlarmStatus};
use crate::domain::batch::BatchChunk;
use crate::domain::events::PushEvent;
use crate::domain::monitoring::{DataPoint, EquipmentHealth, SessionInfo};

/// Codec errors. Every one of them is a protocol anomaly.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither an event nor an ack.
    #[error("frame has neither event nor ack")]
    MissingEvent,

    /// Unknown push event name.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Unrecognized severity spelling.
    #[error("unknown severity: {0}")]
    UnknownSeverity(String),

    /// Unrecognized status spelling.
    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

impl CodecError {
    /// Label for the protocol anomaly metric.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "malformed_frame",
            Self::MissingEvent => "missing_event",
            Self::UnknownEvent(_) => "unknown_event",
            Self::UnknownSeverity(_) => "unknown_severity",
            Self::UnknownStatus(_) => "unknown_status",
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server push.
    Event(PushEvent),
    /// Acknowledgment of request `id`.
    Ack {
        /// Request id.
        id: u64,
        /// Ack payload.
        data: Value,
    },
}

// =============================================================================
// Severity and status mapping
// =============================================================================

/// Parse a severity in any accepted spelling.
///
/// # Errors
///
/// Returns `UnknownSeverity` for anything else.
pub fn parse_severity(value: &str) -> Result<AlarmSeverity, CodecError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "critical" | "urgent" | "emergency" | "fatal" => Ok(AlarmSeverity::Critical),
        "high" | "major" | "error" | "alarm" => Ok(AlarmSeverity::High),
        "medium" | "moderate" | "warning" | "warn" => Ok(AlarmSeverity::Medium),
        "low" | "minor" | "info" | "notice" => Ok(AlarmSeverity::Low),
        _ => Err(CodecError::UnknownSeverity(value.to_string())),
    }
}

/// Parse a status in any accepted spelling.
///
/// # Errors
///
/// Returns `UnknownStatus` for anything else.
pub fn parse_status(value: &str) -> Result<AlarmStatus, CodecError> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "pending" | "unhandled" | "new" | "open" | "active" => Ok(AlarmStatus::Pending),
        "processing" | "acknowledged" | "in_progress" | "handling" | "escalated" => Ok(AlarmStatus::Processing),
        "resolved" | "closed" | "handled" | "cleared" => Ok(AlarmStatus::Resolved),
        "ignored" | "dismissed" | "suppressed" => Ok(AlarmStatus::Ignored),
        _ => Err(CodecError::UnknownStatus(value.to_string())),
    }
}

/// Canonical wire spelling of a severity.
#[must_use]
pub const fn severity_str(severity: AlarmSeverity) -> &'static str {
    severity.as_str()
}

/// Canonical wire spelling of a status.
#[must_use]
pub const fn status_str(status: AlarmStatus) -> &'static str {
    status.as_str()
}

// =============================================================================
// Codec
// =============================================================================

/// JSON codec for the push link.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, unknown events and unmappable
    /// field values.
    pub fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        let frame: RawFrame = serde_json::from_str(text)?;

        if let Some(id) = frame.ack {
            return Ok(Frame::Ack { id, data: frame.data });
        }
        let event = frame.event.ok_or(CodecError::MissingEvent)?;
        self.decode_event(&event, frame.data).map(Frame::Event)
    }

    fn decode_event(&self, event: &str, data: Value) -> Result<PushEvent, CodecError> {
        let event = match event {
            "connected" => {
                let session: SessionMessage = payload(data)?;
                PushEvent::Connected(SessionInfo {
                    user_id: session.user_id,
                    username: session.username,
                    timestamp: session.timestamp,
                })
            }
            "alarm:push" => PushEvent::Alarm(alarm(payload(data)?)?),
            "alarm:batch" => {
                let batch: AlarmBatchMessage = payload(data)?;
                if let Some(count) = batch.count.filter(|count| *count != batch.alarms.len()) {
                    tracing::debug!(count, received = batch.alarms.len(), "Alarm batch count mismatch");
                }
                PushEvent::AlarmBatch(batch.alarms.into_iter().map(alarm).collect::<Result<_, _>>()?)
            }
            "monitoring:new-data" => PushEvent::MonitoringData(data_point(payload(data)?)),
            "monitoring:batch-data" => {
                let batch: BatchDataMessage = payload(data)?;
                PushEvent::MonitoringChunk(BatchChunk {
                    batch_id: batch.batch_id,
                    equipment_id: batch.equipment_id,
                    chunk_index: batch.chunk_index,
                    total_chunks: batch.total_chunks,
                    is_history: batch.is_history,
                    payload: batch.data.into_iter().map(data_point).collect(),
                })
            }
            "equipment:health:update" | "equipment:health:warning" => {
                let health: HealthMessage = payload(data)?;
                PushEvent::EquipmentHealth {
                    health: EquipmentHealth {
                        equipment_id: health.equipment_id,
                        score: health.score,
                        grade: health.grade,
                        soh: health.soh,
                        trend: health.trend,
                        calculated_at: health.calculated_at,
                    },
                    warning: event == "equipment:health:warning",
                }
            }
            "disconnect" => {
                let message: DisconnectMessage = if data.is_null() { DisconnectMessage::default() } else { payload(data)? };
                PushEvent::Disconnect { reason: message.reason }
            }
            "connect_error" => {
                let message: ConnectErrorMessage = payload(data)?;
                PushEvent::ConnectError {
                    error: message.error,
                    code: message.code,
                }
            }
            other => return Err(CodecError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    /// Encode a request with its correlation id.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_request(&self, id: u64, request: &OutboundRequest) -> Result<String, CodecError> {
        let frame = RequestFrame {
            event: request.event_name(),
            data: request.payload(),
            id,
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, CodecError> {
    Ok(serde_json::from_value(data)?)
}

fn alarm(message: AlarmMessage) -> Result<Alarm, CodecError> {
    let mut alarm = Alarm::new(
        message.id,
        message.equipment_id,
        parse_severity(&message.severity)?,
        message.triggered_at,
    );
    alarm.status = parse_status(&message.status)?;
    alarm.monitoring_point = message.monitoring_point;
    alarm.fault_name = message.fault_name;
    alarm.recommended_action = message.recommended_action;
    alarm.handler = message.handler;
    alarm.handled_at = message.handled_at;
    alarm.handler_note = message.handle_note;
    alarm.buffered = message.buffered;
    Ok(alarm)
}

fn data_point(message: DataPointMessage) -> DataPoint {
    DataPoint {
        equipment_id: message.equipment_id,
        timestamp: message.timestamp,
        metric_type: message.metric_type,
        monitoring_point: message.monitoring_point,
        value: message.value,
        unit: message.unit,
        quality: message.quality,
        source: message.source,
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("critical", AlarmSeverity::Critical ; "canonical critical")]
    #[test_case("URGENT", AlarmSeverity::Critical ; "legacy urgent")]
    #[test_case("major", AlarmSeverity::High ; "legacy major")]
    #[test_case("warning", AlarmSeverity::Medium ; "legacy warning")]
    #[test_case(" info ", AlarmSeverity::Low ; "padded info")]
    fn severity_spellings(input: &str, expected: AlarmSeverity) {
        assert_eq!(parse_severity(input).unwrap(), expected);
    }

    #[test_case("unhandled", AlarmStatus::Pending ; "legacy unhandled")]
    #[test_case("acknowledged", AlarmStatus::Processing ; "legacy acknowledged")]
    #[test_case("in-progress", AlarmStatus::Processing ; "dashed in progress")]
    #[test_case("closed", AlarmStatus::Resolved ; "legacy closed")]
    #[test_case("dismissed", AlarmStatus::Ignored ; "legacy dismissed")]
    fn status_spellings(input: &str, expected: AlarmStatus) {
        assert_eq!(parse_status(input).unwrap(), expected);
    }

    #[test]
    fn canonical_spellings_round_trip() {
        for status in AlarmStatus::ALL {
            assert_eq!(parse_status(status_str(status)).unwrap(), status);
        }
        for severity in [AlarmSeverity::Low, AlarmSeverity::Medium, AlarmSeverity::High, AlarmSeverity::Critical] {
            assert_eq!(parse_severity(severity_str(severity)).unwrap(), severity);
        }
    }

    #[test]
    fn decodes_alarm_push() {
        let text = r#"{"event":"alarm:push","data":{
            "id":"a-9","equipmentId":"pump-1","severity":"urgent","status":"acknowledged",
            "triggeredAt":"2026-03-01T10:00:00Z","faultName":"bearing overheat",
            "handler":"oiler","handleNote":"on it","buffered":true}}"#;

        let Frame::Event(PushEvent::Alarm(alarm)) = FrameCodec::new().decode(text).unwrap() else {
            panic!("expected alarm");
        };

        assert_eq!(alarm.severity, AlarmSeverity::Critical);
        assert_eq!(alarm.status, AlarmStatus::Processing);
        assert_eq!(alarm.fault_name.as_deref(), Some("bearing overheat"));
        assert_eq!(alarm.handler_note.as_deref(), Some("on it"));
        assert!(alarm.buffered);
        assert!(!alarm.emergency);
    }

    #[test]
    fn decodes_batch_chunk() {
        let text = r#"{"event":"monitoring:batch-data","data":{
            "batchId":"x","equipmentId":"pump-1","chunkIndex":2,"totalChunks":3,"isHistory":true,
            "data":[{"equipmentId":"pump-1","timestamp":"2026-03-01T10:00:00Z","metricType":"temperature","value":71.2}]}}"#;

        let Frame::Event(PushEvent::MonitoringChunk(chunk)) = FrameCodec::new().decode(text).unwrap() else {
            panic!("expected chunk");
        };

        assert_eq!(chunk.batch_id, "x");
        assert_eq!((chunk.chunk_index, chunk.total_chunks), (2, 3));
        assert!(chunk.is_history);
        assert_eq!(chunk.payload.len(), 1);
    }

    #[test]
    fn decodes_health_warning() {
        let text = r#"{"event":"equipment:health:warning","data":{
            "equipmentId":"fan-2","score":38.5,"grade":"D","soh":0.52,"trend":"declining",
            "calculatedAt":"2026-03-01T10:00:00Z"}}"#;

        let frame = FrameCodec::new().decode(text).unwrap();

        assert!(matches!(frame, Frame::Event(PushEvent::EquipmentHealth { warning: true, .. })));
    }

    #[test]
    fn decodes_ack() {
        let frame = FrameCodec::new()
            .decode(r#"{"ack":4,"data":{"success":true,"room":"equipment:pump-1"}}"#)
            .unwrap();

        assert_eq!(
            frame,
            Frame::Ack {
                id: 4,
                data: serde_json::json!({"success": true, "room": "equipment:pump-1"})
            }
        );
    }

    #[test]
    fn bare_disconnect_has_empty_reason() {
        let frame = FrameCodec::new().decode(r#"{"event":"disconnect"}"#).unwrap();

        assert_eq!(frame, Frame::Event(PushEvent::Disconnect { reason: String::new() }));
    }

    #[test]
    fn anomalies_are_classified() {
        let codec = FrameCodec::new();

        assert_eq!(codec.decode("not json").unwrap_err().kind(), "malformed_frame");
        assert_eq!(codec.decode(r#"{"data":{}}"#).unwrap_err().kind(), "missing_event");
        assert_eq!(codec.decode(r#"{"event":"bogus"}"#).unwrap_err().kind(), "unknown_event");
        let bad_severity = r#"{"event":"alarm:push","data":{"id":"a","equipmentId":"e","severity":"purple","triggeredAt":"2026-03-01T10:00:00Z"}}"#;
        assert_eq!(codec.decode(bad_severity).unwrap_err().kind(), "unknown_severity");
    }

    #[test]
    fn encodes_subscribe_request() {
        let text = FrameCodec::new()
            .encode_request(
                12,
                &OutboundRequest::Subscribe {
                    equipment_id: "pump-1".into(),
                },
            )
            .unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"event": "subscribe:equipment", "data": {"equipmentId": "pump-1"}, "id": 12})
        );
    }
}
