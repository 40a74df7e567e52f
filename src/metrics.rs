use crate::collectors::MetricsSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub hostpulse_cpu_usage_percent: Gauge,
    pub hostpulse_ram_usage_percent: Gauge,
    pub hostpulse_ram_used_bytes: Gauge,
    pub hostpulse_ram_total_bytes: Gauge,
    pub hostpulse_gpu_usage_percent: Gauge,
    pub hostpulse_disk_usage_percent: Gauge,
    pub hostpulse_disk_read_bytes_per_sec: Gauge,
    pub hostpulse_disk_write_bytes_per_sec: Gauge,
    pub hostpulse_network_mbps: Gauge,
    pub hostpulse_net_rx_bytes_per_sec: Gauge,
    pub hostpulse_net_tx_bytes_per_sec: Gauge,
    pub hostpulse_process_count: Gauge,
    pub hostpulse_thread_count: Gauge,
    pub hostpulse_last_tick_timestamp_seconds: Gauge,
    pub hostpulse_uptime_seconds: Gauge,
    pub hostpulse_ticks_total: Counter,
    pub hostpulse_scrape_count_total: Counter,
    pub hostpulse_sample_errors_total: CounterVec,
    pub hostpulse_subscriber_failures_total: CounterVec,
    pub hostpulse_control_operations_total: CounterVec,
    pub hostpulse_alerts_raised_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hostpulse_cpu_usage_percent = Gauge::with_opts(opts!(
            "hostpulse_cpu_usage_percent",
            "Overall CPU utilization in percent (0..100)"
        ))?;
        let hostpulse_ram_usage_percent = Gauge::with_opts(opts!(
            "hostpulse_ram_usage_percent",
            "Used physical memory in percent"
        ))?;
        let hostpulse_ram_used_bytes =
            Gauge::with_opts(opts!("hostpulse_ram_used_bytes", "Used RAM in bytes"))?;
        let hostpulse_ram_total_bytes =
            Gauge::with_opts(opts!("hostpulse_ram_total_bytes", "Total RAM in bytes"))?;
        let hostpulse_gpu_usage_percent = Gauge::with_opts(opts!(
            "hostpulse_gpu_usage_percent",
            "Busiest GPU utilization in percent, 0 when no GPU is readable"
        ))?;
        let hostpulse_disk_usage_percent = Gauge::with_opts(opts!(
            "hostpulse_disk_usage_percent",
            "Used space across all fixed disks in percent"
        ))?;
        let hostpulse_disk_read_bytes_per_sec = Gauge::with_opts(opts!(
            "hostpulse_disk_read_bytes_per_sec",
            "Disk read throughput in bytes per second"
        ))?;
        let hostpulse_disk_write_bytes_per_sec = Gauge::with_opts(opts!(
            "hostpulse_disk_write_bytes_per_sec",
            "Disk write throughput in bytes per second"
        ))?;
        let hostpulse_network_mbps = Gauge::with_opts(opts!(
            "hostpulse_network_mbps",
            "Combined network throughput in megabits per second"
        ))?;
        let hostpulse_net_rx_bytes_per_sec = Gauge::with_opts(opts!(
            "hostpulse_net_rx_bytes_per_sec",
            "Receive throughput across interfaces in bytes per second"
        ))?;
        let hostpulse_net_tx_bytes_per_sec = Gauge::with_opts(opts!(
            "hostpulse_net_tx_bytes_per_sec",
            "Transmit throughput across interfaces in bytes per second"
        ))?;
        let hostpulse_process_count =
            Gauge::with_opts(opts!("hostpulse_process_count", "Number of processes"))?;
        let hostpulse_thread_count =
            Gauge::with_opts(opts!("hostpulse_thread_count", "Number of threads"))?;
        let hostpulse_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "hostpulse_last_tick_timestamp_seconds",
            "Unix timestamp of the last completed sampling tick"
        ))?;
        let hostpulse_uptime_seconds =
            Gauge::with_opts(opts!("hostpulse_uptime_seconds", "Agent uptime in seconds"))?;
        let hostpulse_ticks_total = Counter::with_opts(opts!(
            "hostpulse_ticks_total",
            "Sampling ticks completed"
        ))?;
        let hostpulse_scrape_count_total = Counter::with_opts(opts!(
            "hostpulse_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let hostpulse_sample_errors_total = CounterVec::new(
            opts!(
                "hostpulse_sample_errors_total",
                "Counter reads that fell back to 0, by counter"
            ),
            &["counter"],
        )?;
        let hostpulse_subscriber_failures_total = CounterVec::new(
            opts!(
                "hostpulse_subscriber_failures_total",
                "Subscriber handlers that returned an error or panicked, by feed"
            ),
            &["feed"],
        )?;
        let hostpulse_control_operations_total = CounterVec::new(
            opts!(
                "hostpulse_control_operations_total",
                "Control operations by operation and outcome"
            ),
            &["operation", "outcome"],
        )?;
        let hostpulse_alerts_raised_total = CounterVec::new(
            opts!("hostpulse_alerts_raised_total", "Alerts raised by kind"),
            &["kind"],
        )?;

        register(&registry, &hostpulse_cpu_usage_percent)?;
        register(&registry, &hostpulse_ram_usage_percent)?;
        register(&registry, &hostpulse_ram_used_bytes)?;
        register(&registry, &hostpulse_ram_total_bytes)?;
        register(&registry, &hostpulse_gpu_usage_percent)?;
        register(&registry, &hostpulse_disk_usage_percent)?;
        register(&registry, &hostpulse_disk_read_bytes_per_sec)?;
        register(&registry, &hostpulse_disk_write_bytes_per_sec)?;
        register(&registry, &hostpulse_network_mbps)?;
        register(&registry, &hostpulse_net_rx_bytes_per_sec)?;
        register(&registry, &hostpulse_net_tx_bytes_per_sec)?;
        register(&registry, &hostpulse_process_count)?;
        register(&registry, &hostpulse_thread_count)?;
        register(&registry, &hostpulse_last_tick_timestamp_seconds)?;
        register(&registry, &hostpulse_uptime_seconds)?;
        register(&registry, &hostpulse_ticks_total)?;
        register(&registry, &hostpulse_scrape_count_total)?;
        register(&registry, &hostpulse_sample_errors_total)?;
        register(&registry, &hostpulse_subscriber_failures_total)?;
        register(&registry, &hostpulse_control_operations_total)?;
        register(&registry, &hostpulse_alerts_raised_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            hostpulse_cpu_usage_percent,
            hostpulse_ram_usage_percent,
            hostpulse_ram_used_bytes,
            hostpulse_ram_total_bytes,
            hostpulse_gpu_usage_percent,
            hostpulse_disk_usage_percent,
            hostpulse_disk_read_bytes_per_sec,
            hostpulse_disk_write_bytes_per_sec,
            hostpulse_network_mbps,
            hostpulse_net_rx_bytes_per_sec,
            hostpulse_net_tx_bytes_per_sec,
            hostpulse_process_count,
            hostpulse_thread_count,
            hostpulse_last_tick_timestamp_seconds,
            hostpulse_uptime_seconds,
            hostpulse_ticks_total,
            hostpulse_scrape_count_total,
            hostpulse_sample_errors_total,
            hostpulse_subscriber_failures_total,
            hostpulse_control_operations_total,
            hostpulse_alerts_raised_total,
        }))
    }

    pub fn update_from_snapshot(&self, s: &MetricsSnapshot) {
        self.hostpulse_cpu_usage_percent.set(s.cpu_percent);
        self.hostpulse_ram_usage_percent.set(s.ram_percent);
        self.hostpulse_ram_used_bytes.set(s.ram_used_bytes as f64);
        self.hostpulse_ram_total_bytes.set(s.ram_total_bytes as f64);
        self.hostpulse_gpu_usage_percent.set(s.gpu_percent);
        self.hostpulse_disk_usage_percent.set(s.disk_percent);
        self.hostpulse_disk_read_bytes_per_sec
            .set(s.disk_read_bytes_per_sec);
        self.hostpulse_disk_write_bytes_per_sec
            .set(s.disk_write_bytes_per_sec);
        self.hostpulse_network_mbps.set(s.network_mbps);
        self.hostpulse_net_rx_bytes_per_sec.set(s.net_rx_bytes_per_sec);
        self.hostpulse_net_tx_bytes_per_sec.set(s.net_tx_bytes_per_sec);
        self.hostpulse_process_count.set(s.process_count as f64);
        self.hostpulse_thread_count.set(s.thread_count as f64);
        self.hostpulse_last_tick_timestamp_seconds
            .set(s.timestamp_ms as f64 / 1000.0);
        self.hostpulse_ticks_total.inc();
        self.hostpulse_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
    }

    pub fn inc_scrape_count(&self) {
        self.hostpulse_scrape_count_total.inc();
    }

    pub fn inc_sample_error(&self, counter: &str) {
        self.hostpulse_sample_errors_total
            .with_label_values(&[counter])
            .inc();
    }

    pub fn inc_subscriber_failure(&self, feed: &str) {
        self.hostpulse_subscriber_failures_total
            .with_label_values(&[feed])
            .inc();
    }

    pub fn inc_control_operation(&self, operation: &str, outcome: &str) {
        self.hostpulse_control_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn inc_alert_raised(&self, kind: &str) {
        self.hostpulse_alerts_raised_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_values_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.update_from_snapshot(&MetricsSnapshot {
            cpu_percent: 37.5,
            process_count: 12,
            ..MetricsSnapshot::default()
        });
        metrics.inc_control_operation("kill", "protected");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("hostpulse_cpu_usage_percent 37.5"));
        assert!(text.contains("hostpulse_process_count 12"));
        assert!(text.contains("hostpulse_ticks_total 1"));
        assert!(text.contains(
            "hostpulse_control_operations_total{operation=\"kill\",outcome=\"protected\"} 1"
        ));
    }
}
