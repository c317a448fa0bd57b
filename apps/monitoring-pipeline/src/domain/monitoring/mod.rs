//! Monitoring data points, equipment health and session info.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Equipment the reading belongs to.
    pub equipment_id: String,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Metric type (temperature, vibration, pressure, ...).
    pub metric_type: String,
    /// Monitoring point on the equipment.
    pub monitoring_point: String,
    /// Measured value.
    pub value: f64,
    /// Engineering unit.
    pub unit: String,
    /// Signal quality.
    pub quality: DataQuality,
    /// Producer of the reading.
    pub source: String,
}

impl DataPoint {
    /// Key identifying the series this point belongs to.
    #[must_use]
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            equipment_id: self.equipment_id.clone(),
            metric_type: self.metric_type.clone(),
            monitoring_point: self.monitoring_point.clone(),
        }
    }
}

/// Identifies one measured series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SeriesKey {
    /// Equipment id.
    pub equipment_id: String,
    /// Metric type.
    pub metric_type: String,
    /// Monitoring point.
    pub monitoring_point: String,
}

/// Signal quality of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    /// Reliable reading.
    Good,
    /// Reading may be off.
    Uncertain,
    /// Reading is known to be wrong.
    Bad,
    /// Quality not reported or not recognized.
    #[serde(other)]
    Unknown,
}

/// Direction of an equipment's health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTrend {
    /// Score rising.
    Improving,
    /// Score flat.
    Stable,
    /// Score falling.
    Declining,
    /// Not reported.
    #[serde(other)]
    Unknown,
}

/// Latest health assessment for a piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentHealth {
    /// Equipment id.
    pub equipment_id: String,
    /// Health score.
    pub score: f64,
    /// Letter grade.
    pub grade: String,
    /// State of health.
    pub soh: f64,
    /// Score direction.
    pub trend: HealthTrend,
    /// When the assessment was made.
    pub calculated_at: DateTime<Utc>,
}

/// Session details announced by the server after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Authenticated user id.
    pub user_id: String,
    /// Display name, used as the default alarm handler.
    pub username: String,
    /// Server time of the handshake.
    pub timestamp: DateTime<Utc>,
}
