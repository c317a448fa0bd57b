#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Monitoring Pipeline - Real-time Equipment Monitoring & Alarm Events
//!
//! Keeps one authenticated push connection to the monitoring server,
//! follows a set of equipment, reassembles chunked data transfers, and
//! tracks every alarm through its lifecycle, including emergency flags
//! and bulk actions over many alarms.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and rules
//!   - `alarm`: Alarm record, status machine, classification
//!   - `batch`: Chunk reassembly
//!   - `bulk`: Bulk operation status
//!   - `connection`: Connection states and reconnect backoff
//!   - `events`: Push and routed event types
//!   - `monitoring`: Readings, equipment health, session
//!   - `subscription`: Subscription bookkeeping
//!
//! - **Application**: Ports and services
//!   - `ports`: Push transport, alarm action API
//!   - `services`: Connection manager, registry, dispatcher, alarm engine,
//!     bulk coordinator, monitoring store, and the `Pipeline` that wires them
//!
//! - **Infrastructure**: Adapters and process plumbing
//!   - `socket`: WebSocket transport with heartbeat
//!   - `api`: REST client for alarm actions
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                        ┌───────────────┐    ┌──────────────────┐
//! Monitoring WS ───────► │  Connection   │───►│ Event Dispatcher │──► Alarm engine
//!      ▲                 │   Manager     │    │ (+ reassembly)   │──► Monitoring store
//!      │ subscribe       └───────────────┘    └──────────────────┘──► other listeners
//!      │ replay                 │
//!      └──── Subscription ◄─────┘
//!            Registry
//!
//! Alarm engine / Bulk coordinator ──► Alarm action REST API
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::alarm::{Alarm, AlarmAction, AlarmCounts, AlarmSeverity, AlarmStatus, Classification};
pub use domain::bulk::{BulkOperationStatus, BulkStatus, BulkStrategy};
pub use domain::connection::{ConnectionState, ConnectionStatus};
pub use domain::events::{EventKind, PipelineEvent, PushEvent};

// Application services
pub use application::services::{
    AlarmChange, AlarmLifecycleEngine, BulkCoordinator, EventDispatcher, Pipeline,
    PipelineListener, PipelineSettings,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, PipelineConfig};

// Adapters
pub use infrastructure::api::{AlarmApiClient, AlarmApiConfig};
pub use infrastructure::socket::{WebSocketConfig, WebSocketTransport};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
