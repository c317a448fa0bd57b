//! Pipeline composition root.
//!
//! Wires the components together around one transport and one alarm action
//! API, registers the stores with the dispatcher and owns the background
//! tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::alarm_lifecycle::{AlarmLifecycleEngine, LifecycleConfig};
use super::batch_assembly::BatchAssemblyService;
use super::bulk_coordinator::{BulkConfig, BulkCoordinator};
use super::connection_manager::ConnectionManager;
use super::dispatcher::{EventDispatcher, PipelineListener};
use super::monitoring_store::{MonitoringStore, MonitoringStoreConfig};
use super::subscription_registry::{SubscriptionError, SubscriptionRegistry};
use crate::application::ports::{AlarmActionPort, Credential, TransportPort};
use crate::domain::batch::ReassemblyConfig;
use crate::domain::connection::BackoffConfig;
use crate::domain::events::EventKind;

/// Settings for every component.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Chunk reassembly.
    pub reassembly: ReassemblyConfig,
    /// How often stale batches are swept.
    pub sweep_interval: Duration,
    /// Alarm lifecycle.
    pub lifecycle: LifecycleConfig,
    /// Bulk operations.
    pub bulk: BulkConfig,
    /// Monitoring store.
    pub monitoring: MonitoringStoreConfig,
    /// Capacity of the connection status channel.
    pub status_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            reassembly: ReassemblyConfig::default(),
            sweep_interval: Duration::from_secs(5),
            lifecycle: LifecycleConfig::default(),
            bulk: BulkConfig::default(),
            monitoring: MonitoringStoreConfig::default(),
            status_capacity: 1024,
        }
    }
}

/// The assembled pipeline.
pub struct Pipeline {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    batches: Arc<BatchAssemblyService>,
    alarms: Arc<AlarmLifecycleEngine>,
    bulk: Arc<BulkCoordinator>,
    monitoring: Arc<MonitoringStore>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the pipeline. Nothing runs until [`Pipeline::init`] and
    /// [`Pipeline::connect`].
    #[must_use]
    pub fn new(
        settings: &PipelineSettings,
        transport: Arc<dyn TransportPort>,
        actions: Arc<dyn AlarmActionPort>,
    ) -> Self {
        let batches = Arc::new(BatchAssemblyService::new(settings.reassembly, settings.sweep_interval));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&batches)));
        let registry = Arc::new(SubscriptionRegistry::new());
        let alarms = Arc::new(AlarmLifecycleEngine::new(actions, settings.lifecycle));
        let monitoring = Arc::new(MonitoringStore::new(settings.monitoring));
        let bulk = Arc::new(BulkCoordinator::new(Arc::clone(&alarms), settings.bulk));

        dispatcher.register(
            &[EventKind::SessionStarted, EventKind::Alarm, EventKind::AlarmBatch],
            Arc::clone(&alarms) as Arc<dyn PipelineListener>,
        );
        dispatcher.register(
            &[EventKind::MonitoringData, EventKind::MonitoringBatch, EventKind::EquipmentHealth],
            Arc::clone(&monitoring) as Arc<dyn PipelineListener>,
        );

        let connection = Arc::new(ConnectionManager::new(
            transport,
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            settings.backoff.clone(),
            settings.status_capacity,
        ));

        Self {
            connection,
            registry,
            dispatcher,
            batches,
            alarms,
            bulk,
            monitoring,
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start background tasks. Calling it again does nothing.
    pub fn init(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.background.is_cancelled() {
            return;
        }
        tasks.push(tokio::spawn(
            Arc::clone(&self.batches).run_sweeper(self.background.child_token()),
        ));
        tracing::info!("Pipeline started");
    }

    /// Connect with `credential`. See [`ConnectionManager::connect`].
    pub fn connect(&self, credential: Credential) -> bool {
        self.connection.connect(credential)
    }

    /// Disconnect, keeping subscriptions and stores.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Subscribe to an equipment. See [`SubscriptionRegistry::subscribe`].
    ///
    /// # Errors
    ///
    /// Fails like [`SubscriptionRegistry::subscribe`].
    pub async fn subscribe(&self, equipment_id: &str) -> Result<bool, SubscriptionError> {
        self.registry.subscribe(equipment_id).await
    }

    /// Unsubscribe from an equipment and drop its monitoring data.
    pub async fn unsubscribe(&self, equipment_id: &str) {
        self.registry.unsubscribe(equipment_id).await;
        self.monitoring.clear_equipment(equipment_id);
    }

    /// Disconnect and stop every background task.
    pub async fn teardown(&self) {
        self.connection.shutdown();
        self.alarms.shutdown();
        self.background.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "Background task ended abnormally");
            }
        }
        tracing::info!("Pipeline stopped");
    }

    /// Connection manager.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Event dispatcher, for registering further listeners.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Chunk reassembly.
    #[must_use]
    pub const fn batches(&self) -> &Arc<BatchAssemblyService> {
        &self.batches
    }

    /// Alarm store and actions.
    #[must_use]
    pub const fn alarms(&self) -> &Arc<AlarmLifecycleEngine> {
        &self.alarms
    }

    /// Bulk alarm operations.
    #[must_use]
    pub const fn bulk(&self) -> &Arc<BulkCoordinator> {
        &self.bulk
    }

    /// Monitoring data.
    #[must_use]
    pub const fn monitoring(&self) -> &Arc<MonitoringStore> {
        &self.monitoring
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.connection.state())
            .field("subscriptions", &self.registry.active_ids().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::application::services::test_support::{FakeActions, FakeTransport};
    use crate::domain::alarm::{Alarm, AlarmSeverity, AlarmStatus};
    use crate::domain::batch::BatchChunk;
    use crate::domain::connection::ConnectionState;
    use crate::domain::events::PushEvent;
    use crate::domain::monitoring::{DataPoint, DataQuality, SessionInfo};

    fn pipeline() -> (Pipeline, Arc<FakeTransport>, Arc<FakeActions>) {
        let transport = FakeTransport::new();
        let actions = FakeActions::new();
        let pipeline = Pipeline::new(
            &PipelineSettings::default(),
            Arc::clone(&transport) as Arc<dyn TransportPort>,
            Arc::clone(&actions) as Arc<dyn AlarmActionPort>,
        );
        (pipeline, transport, actions)
    }

    fn reading(value: f64) -> DataPoint {
        DataPoint {
            equipment_id: "pump-1".into(),
            timestamp: Utc::now(),
            metric_type: "temperature".into(),
            monitoring_point: "casing".into(),
            value,
            unit: "C".into(),
            quality: DataQuality::Good,
            source: "plc".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_reach_the_stores() {
        let (pipeline, transport, _actions) = pipeline();
        transport.script(Ok(()));
        pipeline.init();
        pipeline.connect(Credential::new("token"));
        assert_eq!(pipeline.connection().settled().await.state, ConnectionState::Connected);

        transport
            .push(PushEvent::Connected(SessionInfo {
                user_id: "u-7".into(),
                username: "chief".into(),
                timestamp: Utc::now(),
            }))
            .await;
        transport
            .push(PushEvent::Alarm(Alarm::new("a-1", "pump-1", AlarmSeverity::High, Utc::now())))
            .await;
        for index in [2, 1] {
            transport
                .push(PushEvent::MonitoringChunk(BatchChunk {
                    batch_id: "x".into(),
                    equipment_id: "pump-1".into(),
                    chunk_index: index,
                    total_chunks: 2,
                    is_history: true,
                    payload: vec![reading(f64::from(index))],
                }))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pipeline.alarms().counts().pending, 1);
        let history: Vec<f64> = pipeline.monitoring().history("pump-1").iter().map(|p| p.value).collect();
        assert_eq!(history.len(), 2);
        assert_eq!(pipeline.batches().stats().completed, 1);

        pipeline.alarms().acknowledge("a-1", None).await.unwrap();
        let alarm = pipeline.alarms().get("a-1").unwrap();
        assert_eq!(alarm.status, AlarmStatus::Processing);
        assert_eq!(alarm.handler.as_deref(), Some("chief"));

        pipeline.teardown().await;
        assert_eq!(pipeline.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_drops_monitoring_data() {
        let (pipeline, transport, _actions) = pipeline();
        transport.script(Ok(()));
        pipeline.connect(Credential::new("token"));
        pipeline.connection().settled().await;
        assert!(pipeline.subscribe("pump-1").await.unwrap());

        transport.push(PushEvent::MonitoringData(reading(40.0))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.monitoring().latest("pump-1").len(), 1);

        pipeline.unsubscribe("pump-1").await;

        assert!(pipeline.monitoring().latest("pump-1").is_empty());
        assert!(!pipeline.registry().is_active("pump-1"));
        pipeline.teardown().await;
    }

    #[tokio::test]
    async fn init_is_idempotent_and_teardown_stops_tasks() {
        let (pipeline, _transport, _actions) = pipeline();

        pipeline.init();
        pipeline.init();
        assert_eq!(pipeline.tasks.lock().len(), 1);

        pipeline.teardown().await;
        assert!(pipeline.tasks.lock().is_empty());
        pipeline.init();
        assert!(pipeline.tasks.lock().is_empty());
    }
}
