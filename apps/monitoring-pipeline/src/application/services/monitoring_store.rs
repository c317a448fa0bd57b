//! Monitoring Store
//!
//! Listener holding the live view of equipment readings: the latest point per
//! series, a bounded recent window per equipment, historical backfills, and
//! the latest health assessment.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use super::dispatcher::{ListenerError, PipelineListener};
use crate::domain::batch::CompletedBatch;
use crate::domain::events::PipelineEvent;
use crate::domain::monitoring::{DataPoint, EquipmentHealth, SeriesKey};

/// Notification published on every store change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringChange {
    /// Live points were recorded for an equipment.
    Live {
        /// Equipment id.
        equipment_id: String,
        /// Points recorded.
        points: usize,
    },
    /// A historical backfill replaced the history of an equipment.
    History {
        /// Equipment id.
        equipment_id: String,
        /// Batch that carried it.
        batch_id: String,
        /// Points in the backfill.
        points: usize,
    },
    /// A health assessment arrived.
    Health {
        /// Equipment id.
        equipment_id: String,
        /// Sent as a warning.
        warning: bool,
    },
}

/// Latest health assessment for an equipment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    /// The assessment.
    pub health: EquipmentHealth,
    /// Whether it arrived as a warning.
    pub warning: bool,
}

/// Store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringStoreConfig {
    /// Live points kept per equipment.
    pub recent_capacity: usize,
    /// Capacity of the change notification channel.
    pub change_capacity: usize,
}

impl Default for MonitoringStoreConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 500,
            change_capacity: 1024,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    latest: HashMap<SeriesKey, DataPoint>,
    recent: HashMap<String, VecDeque<DataPoint>>,
    history: HashMap<String, Vec<DataPoint>>,
    health: HashMap<String, HealthRecord>,
}

/// In-memory view of monitoring data.
#[derive(Debug)]
pub struct MonitoringStore {
    state: RwLock<StoreState>,
    config: MonitoringStoreConfig,
    changes: broadcast::Sender<MonitoringChange>,
}

impl MonitoringStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: MonitoringStoreConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            state: RwLock::new(StoreState::default()),
            config,
            changes,
        }
    }

    /// Record live points. Out-of-order points never replace a newer latest value.
    ///
    /// Publishes one `Live` change per equipment, in order of first appearance.
    pub fn record_live(&self, points: &[DataPoint]) {
        let mut per_equipment: Vec<(String, usize)> = Vec::new();
        {
            let mut state = self.state.write();
            for point in points {
                match per_equipment.iter_mut().find(|(id, _)| *id == point.equipment_id) {
                    Some((_, count)) => *count += 1,
                    None => per_equipment.push((point.equipment_id.clone(), 1)),
                }

                state
                    .latest
                    .entry(point.series_key())
                    .and_modify(|latest| {
                        if point.timestamp >= latest.timestamp {
                            latest.clone_from(point);
                        }
                    })
                    .or_insert_with(|| point.clone());

                let recent = state.recent.entry(point.equipment_id.clone()).or_default();
                recent.push_back(point.clone());
                while recent.len() > self.config.recent_capacity {
                    recent.pop_front();
                }
            }
        }
        for (equipment_id, points) in per_equipment {
            let _ = self.changes.send(MonitoringChange::Live { equipment_id, points });
        }
    }

    /// Record a reassembled batch.
    pub fn record_batch(&self, batch: &CompletedBatch<DataPoint>) {
        if !batch.is_history {
            self.record_live(&batch.data);
            return;
        }

        let mut data = batch.data.clone();
        data.sort_by_key(|point| point.timestamp);
        self.state.write().history.insert(batch.equipment_id.clone(), data);
        tracing::debug!(
            equipment_id = %batch.equipment_id,
            batch_id = %batch.batch_id,
            points = batch.data.len(),
            "History backfill stored"
        );
        let _ = self.changes.send(MonitoringChange::History {
            equipment_id: batch.equipment_id.clone(),
            batch_id: batch.batch_id.clone(),
            points: batch.data.len(),
        });
    }

    /// Record a health assessment.
    pub fn record_health(&self, health: &EquipmentHealth, warning: bool) {
        if warning {
            tracing::warn!(equipment_id = %health.equipment_id, score = health.score, grade = %health.grade, "Equipment health warning");
        }
        self.state.write().health.insert(
            health.equipment_id.clone(),
            HealthRecord {
                health: health.clone(),
                warning,
            },
        );
        let _ = self.changes.send(MonitoringChange::Health {
            equipment_id: health.equipment_id.clone(),
            warning,
        });
    }

    /// Latest point of every series of an equipment, ordered by series.
    #[must_use]
    pub fn latest(&self, equipment_id: &str) -> Vec<DataPoint> {
        let state = self.state.read();
        let mut points: Vec<(&SeriesKey, &DataPoint)> = state
            .latest
            .iter()
            .filter(|(key, _)| key.equipment_id == equipment_id)
            .collect();
        points.sort_by(|a, b| a.0.cmp(b.0));
        points.into_iter().map(|(_, point)| point.clone()).collect()
    }

    /// Latest point of one series.
    #[must_use]
    pub fn latest_value(&self, key: &SeriesKey) -> Option<DataPoint> {
        self.state.read().latest.get(key).cloned()
    }

    /// Recent live points of an equipment, oldest first.
    #[must_use]
    pub fn recent(&self, equipment_id: &str) -> Vec<DataPoint> {
        self.state
            .read()
            .recent
            .get(equipment_id)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last historical backfill of an equipment, oldest first.
    #[must_use]
    pub fn history(&self, equipment_id: &str) -> Vec<DataPoint> {
        self.state.read().history.get(equipment_id).cloned().unwrap_or_default()
    }

    /// Latest health of an equipment.
    #[must_use]
    pub fn health(&self, equipment_id: &str) -> Option<HealthRecord> {
        self.state.read().health.get(equipment_id).cloned()
    }

    /// Equipment whose latest health arrived as a warning.
    #[must_use]
    pub fn warnings(&self) -> Vec<HealthRecord> {
        let mut warnings: Vec<HealthRecord> = self
            .state
            .read()
            .health
            .values()
            .filter(|record| record.warning)
            .cloned()
            .collect();
        warnings.sort_by(|a, b| a.health.equipment_id.cmp(&b.health.equipment_id));
        warnings
    }

    /// Forget everything held for an equipment.
    pub fn clear_equipment(&self, equipment_id: &str) {
        let mut state = self.state.write();
        state.latest.retain(|key, _| key.equipment_id != equipment_id);
        state.recent.remove(equipment_id);
        state.history.remove(equipment_id);
        state.health.remove(equipment_id);
    }

    /// Change notifications.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<MonitoringChange> {
        self.changes.subscribe()
    }
}

impl PipelineListener for MonitoringStore {
    fn name(&self) -> &str {
        "monitoring-store"
    }

    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError> {
        match event {
            PipelineEvent::MonitoringData(point) => self.record_live(std::slice::from_ref(point)),
            PipelineEvent::MonitoringBatch(batch) => self.record_batch(batch),
            PipelineEvent::EquipmentHealth { health, warning } => self.record_health(health, *warning),
            PipelineEvent::SessionStarted(_) | PipelineEvent::Alarm(_) | PipelineEvent::AlarmBatch(_) => {}
        }
        Ok(())
    }
}
