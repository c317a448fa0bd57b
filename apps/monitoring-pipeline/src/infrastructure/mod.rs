//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// REST client for alarm actions and classification.
pub mod api;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// WebSocket push link.
pub mod socket;

/// OpenTelemetry tracing integration.
pub mod telemetry;
