//! Alarm action REST adapter.

pub mod alarm_client;

pub use alarm_client::{AlarmApiClient, AlarmApiConfig, ApiError};
