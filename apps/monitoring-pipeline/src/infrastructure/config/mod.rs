//! Configuration Module
//!
//! Environment-driven configuration for the pipeline and its adapters.

mod settings;

pub use settings::{
    AlarmSettings, BatchSettings, ConfigError, ConnectionSettings, PipelineConfig,
    ReconnectSettings, ServerSettings, WebSocketSettings,
};
