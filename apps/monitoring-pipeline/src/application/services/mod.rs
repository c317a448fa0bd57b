//! Application Services
//!
//! Components of the pipeline, each owning its own state:
//!
//! - `ConnectionManager`: the push connection, reconnects and status
//! - `SubscriptionRegistry`: equipment subscriptions and their replay
//! - `BatchAssemblyService`: chunked transfer reassembly
//! - `EventDispatcher`: routing of push events to listeners
//! - `AlarmLifecycleEngine`: the alarm collection and its state machine
//! - `BulkCoordinator`: best-effort actions over many alarms
//! - `MonitoringStore`: latest readings and equipment health
//! - `Pipeline`: the composition root

pub mod alarm_lifecycle;
pub mod batch_assembly;
pub mod bulk_coordinator;
pub mod connection_manager;
pub mod dispatcher;
pub mod monitoring_store;
pub mod pipeline;
pub mod subscription_registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use alarm_lifecycle::{
    AUTO_RESOLVE_NOTE, AlarmChange, AlarmLifecycleEngine, EmergencyAction, EmergencyClearReason, LifecycleConfig,
    LifecycleError, SmartOutcome,
};
pub use batch_assembly::BatchAssemblyService;
pub use bulk_coordinator::{BulkConfig, BulkCoordinator, BulkError};
pub use connection_manager::{ConnectionManager, StatusCallback};
pub use dispatcher::{DeliveryReport, EventDispatcher, ListenerError, ListenerId, PipelineListener};
pub use monitoring_store::{HealthRecord, MonitoringChange, MonitoringStore, MonitoringStoreConfig};
pub use pipeline::{Pipeline, PipelineSettings};
pub use subscription_registry::{ReplayReport, RequestOutcome, SubscriptionError, SubscriptionRegistry};
