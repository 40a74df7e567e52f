use crate::collectors::{clamp_percent, now_unix_ms, MetricsSnapshot, Sampler};
use crate::control::ControlError;
use crate::metrics::Metrics;
use crate::platform::{self, parse_f64_loose};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, ProcessExt, System, SystemExt};
use tracing::{debug, warn};

/// Per-second rate of a cumulative counter. The first reading and any
/// reading below the previous one (counter reset) yield 0.
#[derive(Debug, Default)]
pub struct RateCounter {
    last: Option<(u64, Instant)>,
}

impl RateCounter {
    pub fn update(&mut self, total: u64, now: Instant) -> f64 {
        let rate = match self.last {
            Some((prev, at)) if total >= prev => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (total - prev) as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        self.last = Some((total, now));
        rate
    }
}

/// Longest a single nvidia-smi query may take. Kept below the shortest
/// sampling interval so a hung driver cannot stall the ticker.
pub const GPU_QUERY_TIMEOUT: Duration = Duration::from_millis(750);
const GPU_TIMEOUTS_BEFORE_GIVING_UP: u32 = 3;

const NVIDIA_SMI_ARGS: &[&str] = &["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"];

/// nvidia-smi wrapper. Once the tool is found missing, or it keeps timing
/// out, it is never spawned again for the lifetime of the reader.
#[derive(Debug)]
struct GpuReader {
    program: &'static str,
    args: &'static [&'static str],
    timeout: Duration,
    timeouts: u32,
    missing: bool,
}

impl Default for GpuReader {
    fn default() -> Self {
        Self {
            program: "nvidia-smi",
            args: NVIDIA_SMI_ARGS,
            timeout: GPU_QUERY_TIMEOUT,
            timeouts: 0,
            missing: false,
        }
    }
}

impl GpuReader {
    fn read(&mut self) -> Result<f64, String> {
        if self.missing {
            return Err("no supported GPU".to_string());
        }

        let output = match self.run() {
            Ok(output) => output,
            Err(ControlError::InstrumentationUnavailable(msg)) => {
                self.missing = true;
                return Err(msg);
            }
            Err(err @ ControlError::TimedOut(_)) => {
                self.timeouts += 1;
                if self.timeouts >= GPU_TIMEOUTS_BEFORE_GIVING_UP {
                    self.missing = true;
                }
                return Err(err.to_string());
            }
            Err(err) => return Err(err.to_string()),
        };
        self.timeouts = 0;

        if !output.success {
            // driver present but no usable device
            self.missing = true;
            return Err(output.message());
        }

        parse_gpu_utilization(&output.stdout)
            .ok_or_else(|| "nvidia-smi reported no utilization".to_string())
    }

    fn run(&self) -> Result<platform::ToolOutput, ControlError> {
        let first = platform::run_tool_timeout(self.program, self.args, self.timeout);

        #[cfg(target_os = "windows")]
        {
            if let Err(ControlError::InstrumentationUnavailable(_)) = first {
                if self.program == "nvidia-smi" {
                    return platform::run_tool_timeout(
                        r"C:\Windows\System32\nvidia-smi.exe",
                        self.args,
                        self.timeout,
                    );
                }
            }
        }

        first
    }
}

/// Highest utilization across all reported GPUs.
fn parse_gpu_utilization(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(parse_f64_loose)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

/// Samples host-wide counters through sysinfo plus nvidia-smi for the GPU.
pub struct SystemSampler {
    system: System,
    net_rx: RateCounter,
    net_tx: RateCounter,
    last_sample_at: Option<Instant>,
    gpu: GpuReader,
    warned: HashSet<&'static str>,
    metrics: Option<Arc<Metrics>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_networks_list();
        system.refresh_processes();
        Self {
            system,
            net_rx: RateCounter::default(),
            net_tx: RateCounter::default(),
            last_sample_at: None,
            gpu: GpuReader::default(),
            warned: HashSet::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn degraded(&mut self, counter: &'static str, reason: &str) {
        if self.warned.insert(counter) {
            warn!(counter, reason, "counter unavailable, reporting 0");
        } else {
            debug!(counter, reason, "counter still unavailable");
        }
        if let Some(m) = &self.metrics {
            m.inc_sample_error(counter);
        }
    }

    fn refresh(&mut self) -> bool {
        let system = &mut self.system;
        panic::catch_unwind(AssertUnwindSafe(|| {
            system.refresh_cpu();
            system.refresh_memory();
            system.refresh_disks();
            system.refresh_networks_list();
            system.refresh_processes();
        }))
        .is_ok()
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SystemSampler {
    fn sample(&mut self) -> MetricsSnapshot {
        let now = Instant::now();
        let mut snapshot = MetricsSnapshot {
            timestamp_ms: now_unix_ms(),
            ..MetricsSnapshot::default()
        };

        if !self.refresh() {
            self.degraded("sysinfo", "refresh panicked");
            return snapshot;
        }

        snapshot.cpu_percent = clamp_percent(self.system.global_cpu_info().cpu_usage() as f64);

        let ram_total = self.system.total_memory();
        if ram_total == 0 {
            self.degraded("ram", "total memory reported as 0");
        } else {
            let used = self.system.used_memory().min(ram_total);
            snapshot.ram_total_bytes = ram_total;
            snapshot.ram_used_bytes = used;
            snapshot.ram_percent = clamp_percent(used as f64 / ram_total as f64 * 100.0);
        }

        let (disk_total, disk_available) = self
            .system
            .disks()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| {
                (t.saturating_add(d.total_space()), a.saturating_add(d.available_space()))
            });
        if disk_total == 0 {
            self.degraded("disk", "no fixed disks reported");
        } else {
            let used = disk_total.saturating_sub(disk_available);
            snapshot.disk_percent = clamp_percent(used as f64 / disk_total as f64 * 100.0);
        }

        let (read, written) = self
            .system
            .processes()
            .values()
            .map(|p| p.disk_usage())
            .fold((0u64, 0u64), |(r, w), u| {
                (r.saturating_add(u.read_bytes), w.saturating_add(u.written_bytes))
            });
        if let Some(prev) = self.last_sample_at {
            let secs = now.saturating_duration_since(prev).as_secs_f64();
            if secs > 0.0 {
                snapshot.disk_read_bytes_per_sec = read as f64 / secs;
                snapshot.disk_write_bytes_per_sec = written as f64 / secs;
            }
        }
        self.last_sample_at = Some(now);

        let networks = self.system.networks();
        if networks.iter().next().is_none() {
            self.degraded("network", "no network interfaces reported");
        } else {
            let (rx_total, tx_total) = networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (
                    rx.saturating_add(data.total_received()),
                    tx.saturating_add(data.total_transmitted()),
                )
            });
            snapshot.net_rx_bytes_per_sec = self.net_rx.update(rx_total, now);
            snapshot.net_tx_bytes_per_sec = self.net_tx.update(tx_total, now);
            snapshot.network_mbps =
                (snapshot.net_rx_bytes_per_sec + snapshot.net_tx_bytes_per_sec) * 8.0 / 1_000_000.0;
        }

        snapshot.process_count = self.system.processes().len() as u64;

        let sched = platform::sched_info();
        if sched.is_empty() {
            self.degraded("threads", "thread counts not available on this host");
        } else {
            snapshot.thread_count = sched.values().map(|s| s.threads as u64).sum();
        }

        match self.gpu.read() {
            Ok(v) => snapshot.gpu_percent = clamp_percent(v),
            Err(reason) => self.degraded("gpu", &reason),
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_starts_at_zero() {
        let t0 = Instant::now();
        let mut rc = RateCounter::default();
        assert_eq!(rc.update(1_000, t0), 0.0);
        assert_eq!(rc.update(3_000, t0 + Duration::from_secs(2)), 1_000.0);
    }

    #[test]
    fn rate_counter_reset_yields_zero() {
        let t0 = Instant::now();
        let mut rc = RateCounter::default();
        rc.update(5_000, t0);
        assert_eq!(rc.update(100, t0 + Duration::from_secs(1)), 0.0);
        assert_eq!(rc.update(600, t0 + Duration::from_secs(2)), 500.0);
    }

    #[test]
    fn gpu_utilization_takes_busiest_device() {
        assert_eq!(parse_gpu_utilization("12\n87\n3\n"), Some(87.0));
        assert_eq!(parse_gpu_utilization("[N/A]\n"), None);
        assert_eq!(parse_gpu_utilization(""), None);
    }

    #[test]
    fn missing_gpu_is_not_queried_again() {
        let mut gpu = GpuReader {
            program: "hostpulse-definitely-missing-tool",
            ..GpuReader::default()
        };
        assert!(gpu.read().is_err());
        assert!(gpu.missing);
        assert!(gpu.read().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn hung_gpu_tool_reports_zero_within_deadline() {
        let mut sampler = SystemSampler::new();
        sampler.gpu = GpuReader {
            program: "sleep",
            args: &["5"],
            timeout: Duration::from_millis(200),
            ..GpuReader::default()
        };

        for _ in 0..GPU_TIMEOUTS_BEFORE_GIVING_UP {
            let started = Instant::now();
            let s = sampler.sample();
            assert_eq!(s.gpu_percent, 0.0);
            assert!(started.elapsed() < Duration::from_secs(3));
        }
        assert!(sampler.gpu.missing);
        assert!(sampler.warned.contains("gpu"));
    }

    #[test]
    fn samples_stay_in_range() {
        let mut sampler = SystemSampler::new();
        for _ in 0..2 {
            let s = sampler.sample();
            assert!(s.timestamp_ms > 0);
            for pct in [s.cpu_percent, s.ram_percent, s.gpu_percent, s.disk_percent] {
                assert!((0.0..=100.0).contains(&pct));
            }
            assert!(s.network_mbps >= 0.0);
            assert!(s.disk_read_bytes_per_sec >= 0.0);
        }
    }
}
