pub mod processes;
pub mod system;

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// One tick's worth of host telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp_ms: u64,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub ram_used_bytes: u64,
    pub ram_total_bytes: u64,
    pub gpu_percent: f64,
    pub disk_percent: f64,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
    pub network_mbps: f64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
    pub process_count: u64,
    pub thread_count: u64,
}

/// Source of snapshots. Implementations never fail: a counter that cannot be
/// read reports 0 for that field.
pub trait Sampler: Send {
    fn sample(&mut self) -> MetricsSnapshot;
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_percentages() {
        assert_eq!(clamp_percent(150.0), 100.0);
        assert_eq!(clamp_percent(-3.0), 0.0);
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(42.0), 42.0);
    }
}
