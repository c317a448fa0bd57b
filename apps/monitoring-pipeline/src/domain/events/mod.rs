//! Event types flowing through the pipeline.
//!
//! [`PushEvent`] is what the transport decodes from the wire. The dispatcher
//! turns it into a [`PipelineEvent`] (joining chunked transfers on the way)
//! and routes it by [`EventKind`] to registered listeners.

use serde::Serialize;

use crate::domain::alarm::Alarm;
use crate::domain::batch::{BatchChunk, CompletedBatch};
use crate::domain::monitoring::{DataPoint, EquipmentHealth, SessionInfo};

/// A decoded server push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Handshake completed.
    Connected(SessionInfo),
    /// A new or updated alarm.
    Alarm(Alarm),
    /// A set of alarms (for example the buffer replayed after a reconnect).
    AlarmBatch(Vec<Alarm>),
    /// A live reading.
    MonitoringData(DataPoint),
    /// One chunk of a chunked data transfer.
    MonitoringChunk(BatchChunk<DataPoint>),
    /// An equipment health assessment.
    EquipmentHealth {
        /// The assessment.
        health: EquipmentHealth,
        /// Sent as a warning rather than a routine update.
        warning: bool,
    },
    /// The server is closing the link.
    Disconnect {
        /// Reason given by the server.
        reason: String,
    },
    /// The server refused the connection.
    ConnectError {
        /// Error message.
        error: String,
        /// Error code, when provided.
        code: Option<String>,
    },
}

impl PushEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Alarm(_) => "alarm:push",
            Self::AlarmBatch(_) => "alarm:batch",
            Self::MonitoringData(_) => "monitoring:new-data",
            Self::MonitoringChunk(_) => "monitoring:batch-data",
            Self::EquipmentHealth { warning: false, .. } => "equipment:health:update",
            Self::EquipmentHealth { warning: true, .. } => "equipment:health:warning",
            Self::Disconnect { .. } => "disconnect",
            Self::ConnectError { .. } => "connect_error",
        }
    }
}

/// Event kinds listeners can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// [`PipelineEvent::SessionStarted`].
    SessionStarted,
    /// [`PipelineEvent::Alarm`].
    Alarm,
    /// [`PipelineEvent::AlarmBatch`].
    AlarmBatch,
    /// [`PipelineEvent::MonitoringData`].
    MonitoringData,
    /// [`PipelineEvent::MonitoringBatch`].
    MonitoringBatch,
    /// [`PipelineEvent::EquipmentHealth`].
    EquipmentHealth,
}

impl EventKind {
    /// Every kind.
    pub const ALL: [Self; 6] = [
        Self::SessionStarted,
        Self::Alarm,
        Self::AlarmBatch,
        Self::MonitoringData,
        Self::MonitoringBatch,
        Self::EquipmentHealth,
    ];

    /// Label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::Alarm => "alarm",
            Self::AlarmBatch => "alarm_batch",
            Self::MonitoringData => "monitoring_data",
            Self::MonitoringBatch => "monitoring_batch",
            Self::EquipmentHealth => "equipment_health",
        }
    }
}

/// An event delivered to pipeline listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A new session started on the link.
    SessionStarted(SessionInfo),
    /// A new or updated alarm.
    Alarm(Alarm),
    /// A set of alarms.
    AlarmBatch(Vec<Alarm>),
    /// A live reading.
    MonitoringData(DataPoint),
    /// A reassembled chunked transfer.
    MonitoringBatch(CompletedBatch<DataPoint>),
    /// An equipment health assessment.
    EquipmentHealth {
        /// The assessment.
        health: EquipmentHealth,
        /// Sent as a warning rather than a routine update.
        warning: bool,
    },
}

impl PipelineEvent {
    /// Routing kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::SessionStarted(_) => EventKind::SessionStarted,
            Self::Alarm(_) => EventKind::Alarm,
            Self::AlarmBatch(_) => EventKind::AlarmBatch,
            Self::MonitoringData(_) => EventKind::MonitoringData,
            Self::MonitoringBatch(_) => EventKind::MonitoringBatch,
            Self::EquipmentHealth { .. } => EventKind::EquipmentHealth,
        }
    }

    /// Equipment the event concerns, when there is exactly one.
    #[must_use]
    pub fn equipment_id(&self) -> Option<&str> {
        match self {
            Self::Alarm(alarm) => Some(&alarm.equipment_id),
            Self::MonitoringData(point) => Some(&point.equipment_id),
            Self::MonitoringBatch(batch) => Some(&batch.equipment_id),
            Self::EquipmentHealth { health, .. } => Some(&health.equipment_id),
            Self::SessionStarted(_) | Self::AlarmBatch(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alarm::AlarmSeverity;
    use chrono::Utc;

    #[test]
    fn kinds_follow_variants() {
        let alarm = Alarm::new("a-1", "pump-1", AlarmSeverity::Low, Utc::now());
        assert_eq!(PipelineEvent::Alarm(alarm.clone()).kind(), EventKind::Alarm);
        assert_eq!(PipelineEvent::AlarmBatch(vec![alarm]).kind(), EventKind::AlarmBatch);
    }

    #[test]
    fn equipment_id_is_exposed_for_single_equipment_events() {
        let alarm = Alarm::new("a-1", "pump-1", AlarmSeverity::Low, Utc::now());
        assert_eq!(PipelineEvent::Alarm(alarm.clone()).equipment_id(), Some("pump-1"));
        assert_eq!(PipelineEvent::AlarmBatch(vec![alarm]).equipment_id(), None);
    }
}
