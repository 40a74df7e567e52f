//! Host telemetry engine with process, service and session control.

pub mod alerts;
pub mod collectors;
pub mod config;
pub mod control;
pub mod engine;
pub mod export;
pub mod history;
pub mod http;
pub mod metrics;
mod platform;
