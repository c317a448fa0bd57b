//! Domain Layer - Core monitoring and alarm types.
//!
//! This layer contains the pure state machines and value types of the
//! pipeline. Nothing here performs I/O; time is passed in by callers so the
//! logic stays deterministic under test.

/// Alarm records and the alarm status state machine.
pub mod alarm;

/// Chunked batch reassembly.
pub mod batch;

/// Bulk operation status and per-item accounting.
pub mod bulk;

/// Connection state and reconnection backoff.
pub mod connection;

/// Inbound push events and the events published to pipeline listeners.
pub mod events;

/// Monitoring data points, equipment health and session info.
pub mod monitoring;

/// Subscription bookkeeping.
pub mod subscription;
