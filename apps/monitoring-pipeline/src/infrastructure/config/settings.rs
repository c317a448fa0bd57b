//! Pipeline Configuration Settings
//!
//! Configuration types for the monitoring pipeline, loaded from environment
//! variables. Only the endpoints and the bearer token are required; every
//! tuning knob falls back to its default when unset or unparsable.

use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use crate::application::ports::Credential;
use crate::application::services::{
    BulkConfig, LifecycleConfig, MonitoringStoreConfig, PipelineSettings,
};
use crate::domain::batch::ReassemblyConfig;
use crate::domain::connection::BackoffConfig;
use crate::infrastructure::api::AlarmApiConfig;
use crate::infrastructure::socket::{HeartbeatConfig, WebSocketConfig};
use crate::infrastructure::telemetry::{DEFAULT_OTLP_ENDPOINT, DEFAULT_SERVICE_NAME, TelemetryConfig};

/// Endpoints and identity.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Push endpoint (`ws://` or `wss://`).
    pub ws_url: String,
    /// REST base URL for alarm actions.
    pub api_url: String,
    /// Bearer token, redacted in debug output.
    pub credential: Credential,
    /// Equipment subscribed at startup.
    pub equipment_ids: Vec<String>,
}

/// WebSocket link settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering the link dead.
    pub heartbeat_timeout: Duration,
    /// How long a request waits for its ack.
    pub request_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Consecutive failures before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Jitter as a fraction of the delay.
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.1,
        }
    }
}

/// Chunked batch settings.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// An incomplete batch untouched for this long is evicted.
    pub staleness: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Alarm handling settings.
#[derive(Debug, Clone)]
pub struct AlarmSettings {
    /// How long an emergency flag stays up unhandled.
    pub emergency_duration: Duration,
    /// Bulk items in flight at once.
    pub bulk_concurrency: usize,
    /// Largest accepted bulk id list.
    pub bulk_max_items: usize,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            emergency_duration: Duration::from_secs(300),
            bulk_concurrency: 4,
            bulk_max_items: 500,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health and metrics HTTP port (0 = disabled).
    pub health_port: u16,
    /// Capacity of the listener change channels.
    pub listener_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            listener_capacity: 1024,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Endpoints and identity.
    pub connection: ConnectionSettings,
    /// WebSocket link settings.
    pub websocket: WebSocketSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectSettings,
    /// Chunked batch settings.
    pub batch: BatchSettings,
    /// Alarm handling settings.
    pub alarms: AlarmSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Logging and trace export.
    pub telemetry: TelemetryConfig,
}

impl PipelineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing,
    /// empty, or name an endpoint with the wrong scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`PipelineConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = &lookup;

        let ws_url = required(env, "MONITOR_WS_URL")?;
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_WS_URL".to_string(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }

        let api_url = required(env, "MONITOR_API_URL")?;
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_API_URL".to_string(),
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }

        let token = required(env, "MONITOR_TOKEN")?;

        let equipment_ids = env("MONITOR_EQUIPMENT_IDS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        let connection = ConnectionSettings {
            ws_url,
            api_url: api_url.trim_end_matches('/').to_string(),
            credential: Credential::new(token),
            equipment_ids,
        };

        let websocket = WebSocketSettings {
            heartbeat_interval: parse_env_duration_secs(
                env,
                "MONITOR_HEARTBEAT_INTERVAL_SECS",
                WebSocketSettings::default().heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                env,
                "MONITOR_HEARTBEAT_TIMEOUT_SECS",
                WebSocketSettings::default().heartbeat_timeout,
            ),
            request_timeout: parse_env_duration_secs(
                env,
                "MONITOR_REQUEST_TIMEOUT_SECS",
                WebSocketSettings::default().request_timeout,
            ),
        };

        let reconnect = ReconnectSettings {
            base_delay: parse_env_duration_millis(
                env,
                "MONITOR_RECONNECT_BASE_MS",
                ReconnectSettings::default().base_delay,
            ),
            multiplier: parse_env_f64(
                env,
                "MONITOR_RECONNECT_MULTIPLIER",
                ReconnectSettings::default().multiplier,
            ),
            max_delay: parse_env_duration_secs(
                env,
                "MONITOR_RECONNECT_MAX_SECS",
                ReconnectSettings::default().max_delay,
            ),
            max_attempts: parse_env_u32(
                env,
                "MONITOR_RECONNECT_MAX_ATTEMPTS",
                ReconnectSettings::default().max_attempts,
            ),
            jitter: parse_env_f64(
                env,
                "MONITOR_RECONNECT_JITTER",
                ReconnectSettings::default().jitter,
            ),
        };

        let batch = BatchSettings {
            staleness: parse_env_duration_secs(
                env,
                "MONITOR_BATCH_STALENESS_SECS",
                BatchSettings::default().staleness,
            ),
            sweep_interval: parse_env_duration_secs(
                env,
                "MONITOR_BATCH_SWEEP_SECS",
                BatchSettings::default().sweep_interval,
            ),
        };

        let alarms = AlarmSettings {
            emergency_duration: parse_env_duration_secs(
                env,
                "MONITOR_EMERGENCY_DURATION_SECS",
                AlarmSettings::default().emergency_duration,
            ),
            bulk_concurrency: parse_env_usize(
                env,
                "MONITOR_BULK_CONCURRENCY",
                AlarmSettings::default().bulk_concurrency,
            )
            .max(1),
            bulk_max_items: parse_env_usize(
                env,
                "MONITOR_BULK_MAX_ITEMS",
                AlarmSettings::default().bulk_max_items,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16(
                env,
                "MONITOR_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
            listener_capacity: parse_env_usize(
                env,
                "MONITOR_LISTENER_CAPACITY",
                ServerSettings::default().listener_capacity,
            )
            .max(1),
        };

        let export = env("OTEL_ENABLED").is_none_or(|v| !v.trim().eq_ignore_ascii_case("false"));
        let telemetry = TelemetryConfig {
            service_name: env("OTEL_SERVICE_NAME")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            otlp_endpoint: export.then(|| {
                env("OTEL_EXPORTER_OTLP_ENDPOINT")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string())
            }),
            level: parse_env_level(env, "MONITOR_LOG_LEVEL", LevelFilter::INFO),
            dependency_level: parse_env_level(env, "MONITOR_DEPENDENCY_LOG_LEVEL", LevelFilter::WARN),
            extra_directives: env("RUST_LOG"),
        };

        Ok(Self {
            connection,
            websocket,
            reconnect,
            batch,
            alarms,
            server,
            telemetry,
        })
    }

    /// Settings for assembling the pipeline.
    #[must_use]
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let capacity = self.server.listener_capacity;
        PipelineSettings {
            backoff: BackoffConfig {
                base_delay: self.reconnect.base_delay,
                max_delay: self.reconnect.max_delay,
                multiplier: self.reconnect.multiplier,
                jitter_factor: self.reconnect.jitter,
                max_attempts: self.reconnect.max_attempts,
            },
            reassembly: ReassemblyConfig {
                staleness: self.batch.staleness,
                ..ReassemblyConfig::default()
            },
            sweep_interval: self.batch.sweep_interval,
            lifecycle: LifecycleConfig {
                emergency_duration: self.alarms.emergency_duration,
                change_capacity: capacity,
            },
            bulk: BulkConfig {
                concurrency: self.alarms.bulk_concurrency,
                max_items: self.alarms.bulk_max_items,
            },
            monitoring: MonitoringStoreConfig {
                change_capacity: capacity,
                ..MonitoringStoreConfig::default()
            },
            status_capacity: capacity,
        }
    }

    /// Settings for the WebSocket transport.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            heartbeat: HeartbeatConfig {
                ping_interval: self.websocket.heartbeat_interval,
                pong_timeout: self.websocket.heartbeat_timeout,
            },
            request_timeout: self.websocket.request_timeout,
            event_buffer: self.server.listener_capacity,
            ..WebSocketConfig::new(self.connection.ws_url.clone())
        }
    }

    /// Settings for the alarm action REST client.
    #[must_use]
    pub fn api_config(&self) -> AlarmApiConfig {
        AlarmApiConfig {
            base_url: self.connection.api_url.clone(),
            credential: self.connection.credential.clone(),
            timeout: self.websocket.request_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is present but unusable.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn required(env: Lookup<'_>, key: &str) -> Result<String, ConfigError> {
    let value = env(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value.to_string())
}

fn parse_list(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

fn parse_env_u16(env: Lookup<'_>, key: &str, default: u16) -> u16 {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(env: Lookup<'_>, key: &str, default: u32) -> u32 {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(env: Lookup<'_>, key: &str, default: usize) -> usize {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(env: Lookup<'_>, key: &str, default: f64) -> f64 {
    env(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn parse_env_level(env: Lookup<'_>, key: &str, default: LevelFilter) -> LevelFilter {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(env: Lookup<'_>, key: &str, default: Duration) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(env: Lookup<'_>, key: &str, default: Duration) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
