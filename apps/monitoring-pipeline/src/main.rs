//! Monitoring Pipeline Binary
//!
//! Connects to the monitoring server, follows the configured equipment and
//! keeps the alarm and monitoring stores current.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin monitoring-pipeline
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MONITOR_WS_URL`: Push endpoint (`ws://` or `wss://`)
//! - `MONITOR_API_URL`: Alarm action REST base URL
//! - `MONITOR_TOKEN`: Bearer token
//!
//! ## Optional
//! - `MONITOR_EQUIPMENT_IDS`: Comma-separated equipment to subscribe at startup
//! - `MONITOR_RECONNECT_*`: Reconnect backoff tuning
//! - `MONITOR_HEARTBEAT_INTERVAL_SECS` / `MONITOR_HEARTBEAT_TIMEOUT_SECS`
//! - `MONITOR_EMERGENCY_DURATION_SECS`: Emergency flag lifetime (default: 300)
//! - `MONITOR_HEALTH_PORT`: Health and metrics HTTP port (default: 8083, 0 = disabled)
//! - `MONITOR_LOG_LEVEL`: Pipeline log level (default: info)
//! - `MONITOR_DEPENDENCY_LOG_LEVEL`: Log level for other crates (default: warn)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP/gRPC collector (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name on exported spans (default: monitoring-pipeline)
//! - `RUST_LOG`: Extra filter directives, applied last

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use monitoring_pipeline::application::ports::{AlarmActionPort, TransportPort};
use monitoring_pipeline::application::services::{
    AlarmChange, ListenerError, Pipeline, PipelineListener,
};
use monitoring_pipeline::domain::events::{EventKind, PipelineEvent};
use monitoring_pipeline::infrastructure::api::AlarmApiClient;
use monitoring_pipeline::infrastructure::health::{HealthServer, HealthServerState};
use monitoring_pipeline::infrastructure::socket::WebSocketTransport;
use monitoring_pipeline::infrastructure::telemetry;
use monitoring_pipeline::{PipelineConfig, init_metrics};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let _telemetry_guard = telemetry::init(&config.telemetry);

    tracing::info!("Starting monitoring pipeline");
    log_config(&config);

    let _metrics_handle = init_metrics().context("installing Prometheus recorder")?;

    let shutdown_token = CancellationToken::new();

    let transport: Arc<dyn TransportPort> =
        Arc::new(WebSocketTransport::new(config.websocket_config()));
    let actions: Arc<dyn AlarmActionPort> = Arc::new(AlarmApiClient::new(config.api_config()).context("building alarm API client")?);

    let pipeline = Arc::new(Pipeline::new(
        &config.pipeline_settings(),
        transport,
        actions,
    ));
    pipeline
        .dispatcher()
        .register(&EventKind::ALL, Arc::new(EventLog));
    pipeline.connection().on_status_change(|status| {
        tracing::info!(
            state = status.state.as_str(),
            attempt = status.attempt,
            next_retry = ?status.next_retry,
            reason = ?status.reason,
            "Connection status changed"
        );
    });
    pipeline.init();

    let alarm_watch = tokio::spawn(watch_alarms(
        Arc::clone(&pipeline),
        shutdown_token.child_token(),
    ));

    if config.server.health_port == 0 {
        tracing::info!("Health server disabled");
    } else {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&pipeline),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.child_token(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    pipeline.connect(config.connection.credential.clone());
    for equipment_id in &config.connection.equipment_ids {
        match pipeline.subscribe(equipment_id).await {
            Ok(true) => tracing::info!(equipment_id = %equipment_id, "Subscribed"),
            Ok(false) => {
                tracing::info!(equipment_id = %equipment_id, "Subscription queued until connected");
            }
            Err(e) => tracing::warn!(equipment_id = %equipment_id, error = %e, "Subscribe failed"),
        }
    }

    tracing::info!("Monitoring pipeline ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, pipeline.teardown())
        .await
        .is_err()
    {
        tracing::warn!("Pipeline teardown timed out");
    }
    let _ = alarm_watch.await;

    tracing::info!("Monitoring pipeline stopped");
    Ok(())
}

/// Logs every routed event at debug level.
struct EventLog;

impl PipelineListener for EventLog {
    fn name(&self) -> &str {
        "event-log"
    }

    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError> {
        match event {
            PipelineEvent::SessionStarted(session) => {
                tracing::info!(username = %session.username, "Session started");
            }
            PipelineEvent::Alarm(alarm) => {
                tracing::debug!(alarm_id = %alarm.id, status = ?alarm.status, "Alarm event");
            }
            PipelineEvent::AlarmBatch(alarms) => {
                tracing::debug!(count = alarms.len(), "Alarm batch");
            }
            PipelineEvent::MonitoringData(point) => {
                tracing::trace!(equipment_id = %point.equipment_id, "Monitoring data");
            }
            PipelineEvent::MonitoringBatch(batch) => {
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    equipment_id = %batch.equipment_id,
                    points = batch.data.len(),
                    history = batch.is_history,
                    "Monitoring batch"
                );
            }
            PipelineEvent::EquipmentHealth { health, warning } => {
                tracing::debug!(equipment_id = %health.equipment_id, warning, "Equipment health");
            }
        }
        Ok(())
    }
}

/// Surface emergency transitions in the log until shutdown.
async fn watch_alarms(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let mut changes = pipeline.alarms().subscribe_changes();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(AlarmChange::EmergencyRaised { alarm_id }) => {
                    tracing::warn!(alarm_id = %alarm_id, "Emergency alarm raised");
                }
                Ok(AlarmChange::EmergencyCleared { alarm_id, reason }) => {
                    tracing::info!(alarm_id = %alarm_id, ?reason, "Emergency cleared");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Alarm change watcher lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &PipelineConfig) {
    tracing::info!(
        ws_url = %config.connection.ws_url,
        api_url = %config.connection.api_url,
        equipment = config.connection.equipment_ids.len(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        base_delay_ms = config.reconnect.base_delay.as_millis(),
        max_delay_secs = config.reconnect.max_delay.as_secs(),
        max_attempts = config.reconnect.max_attempts,
        emergency_secs = config.alarms.emergency_duration.as_secs(),
        "Tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
