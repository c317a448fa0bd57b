//! Logging and Trace Export
//!
//! Installs the global `tracing` subscriber: a fmt layer filtered per crate,
//! plus an OpenTelemetry layer shipping spans over OTLP/gRPC when an
//! endpoint is configured. Settings come from [`PipelineConfig`], so the
//! pipeline's own log level and the level for its dependencies (WebSocket,
//! HTTP and gRPC stacks) are set independently.
//!
//! [`PipelineConfig`]: crate::infrastructure::config::PipelineConfig

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tracing target of this crate.
const CRATE_TARGET: &str = "monitoring_pipeline";

/// Service name attached to exported spans.
pub const DEFAULT_SERVICE_NAME: &str = "monitoring-pipeline";

/// Default OTLP/gRPC collector.
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

// =============================================================================
// Configuration
// =============================================================================

/// Logging and export settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name on exported spans.
    pub service_name: String,
    /// OTLP collector; `None` keeps traces local.
    pub otlp_endpoint: Option<String>,
    /// Level for the pipeline's own events.
    pub level: LevelFilter,
    /// Level for everything else (tungstenite, reqwest, hyper, tonic, ...).
    pub dependency_level: LevelFilter,
    /// Raw `RUST_LOG` directives, applied last.
    pub extra_directives: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: Some(DEFAULT_OTLP_ENDPOINT.to_string()),
            level: LevelFilter::INFO,
            dependency_level: LevelFilter::WARN,
            extra_directives: None,
        }
    }
}

impl TelemetryConfig {
    /// Filter directives in `EnvFilter` syntax.
    ///
    /// Later directives win for the same target, so `RUST_LOG` can still
    /// raise or lower any crate.
    #[must_use]
    pub fn filter_spec(&self) -> String {
        let mut spec = format!("{},{CRATE_TARGET}={}", self.dependency_level, self.level);
        if let Some(extra) = self.extra_directives.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            spec.push(',');
            spec.push_str(extra);
        }
        spec
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Flushes and shuts down span export when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            // The subscriber may already be gone at this point.
            eprintln!("span export shutdown failed: {e}");
        }
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Install the global subscriber. Keep the guard alive until exit.
///
/// An unusable collector endpoint downgrades to local logging with a
/// warning instead of failing startup.
#[must_use]
pub fn init(config: &TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::new(config.filter_spec());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let (tracer_provider, export_error) = match config.otlp_endpoint.as_deref() {
        None => (None, None),
        Some(endpoint) => match build_tracer_provider(&config.service_name, endpoint) {
            Ok(provider) => (Some(provider), None),
            Err(error) => (None, Some(error)),
        },
    };
    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
    {
        eprintln!("tracing subscriber already installed: {e}");
    }

    if let Some(error) = export_error {
        tracing::warn!(
            error = %error,
            endpoint = config.otlp_endpoint.as_deref().unwrap_or_default(),
            "OTLP exporter unavailable, traces stay local"
        );
    }
    tracing::debug!(
        filter = %config.filter_spec(),
        exporting = tracer_provider.is_some(),
        "Telemetry initialized"
    );

    TelemetryGuard { tracer_provider }
}

fn build_tracer_provider(service_name: &str, endpoint: &str) -> Result<SdkTracerProvider, String> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| e.to_string())?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build())
}

// =============================================================================
// Tests
// =============================================================================
