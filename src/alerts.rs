use crate::collectors::MetricsSnapshot;
use crate::config::AlertsConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    CpuLoad,
    RamUsage,
    DiskUsage,
    GpuLoad,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::CpuLoad => "cpu_load",
            AlertKind::RamUsage => "ram_usage",
            AlertKind::DiskUsage => "disk_usage",
            AlertKind::GpuLoad => "gpu_load",
        }
    }

    fn title(self) -> &'static str {
        match self {
            AlertKind::CpuLoad => "High CPU usage",
            AlertKind::RamUsage => "High memory usage",
            AlertKind::DiskUsage => "Disk almost full",
            AlertKind::GpuLoad => "High GPU usage",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub title: String,
    pub message: String,
}

/// Where user-visible alerts go (desktop toast, chat, log).
pub trait NotificationSink: Send + Sync {
    fn show_alert(&self, alert: &Alert);
}

/// Default sink: alerts become warn-level log events.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn show_alert(&self, alert: &Alert) {
        warn!(
            kind = %alert.kind,
            value = alert.value,
            threshold = alert.threshold,
            "{}",
            alert.message
        );
    }
}

/// Threshold checks with a per-kind cooldown so a sustained condition is
/// reported once per cooldown window.
#[derive(Debug)]
pub struct AlertEvaluator {
    cfg: AlertsConfig,
    last_sent: HashMap<AlertKind, i64>,
}

impl AlertEvaluator {
    pub fn new(cfg: AlertsConfig) -> Self {
        Self {
            cfg,
            last_sent: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot, now_unix: i64) -> Vec<Alert> {
        if !self.cfg.enabled {
            return Vec::new();
        }

        let checks = [
            (
                AlertKind::CpuLoad,
                snapshot.cpu_percent,
                self.cfg.cpu_load_threshold_percent,
            ),
            (
                AlertKind::RamUsage,
                snapshot.ram_percent,
                self.cfg.ram_usage_threshold_percent,
            ),
            (
                AlertKind::DiskUsage,
                snapshot.disk_percent,
                self.cfg.disk_usage_threshold_percent,
            ),
            (
                AlertKind::GpuLoad,
                snapshot.gpu_percent,
                self.cfg.gpu_load_threshold_percent,
            ),
        ];

        let cooldown = self.cfg.cooldown_secs as i64;
        let mut out = Vec::new();
        for (kind, value, threshold) in checks {
            if value >= threshold && should_emit(kind, now_unix, cooldown, &mut self.last_sent) {
                out.push(Alert {
                    kind,
                    value,
                    threshold,
                    title: kind.title().to_string(),
                    message: format!(
                        "{}: {value:.1}% (threshold {threshold:.1}%)",
                        kind.title()
                    ),
                });
            }
        }
        out
    }
}

fn should_emit(
    kind: AlertKind,
    now_unix: i64,
    cooldown_secs: i64,
    last_sent: &mut HashMap<AlertKind, i64>,
) -> bool {
    if let Some(last) = last_sent.get(&kind) {
        if now_unix - *last < cooldown_secs {
            return false;
        }
    }
    last_sent.insert(kind, now_unix);
    true
}
