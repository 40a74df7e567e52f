//! Sampling loop. One ticker drives every cycle: sample, append to the
//! history buffers, broadcast to subscribers, then poll the process and
//! service inventories when somebody listens to them.

use crate::alerts::{AlertEvaluator, LogNotifier, NotificationSink};
use crate::collectors::processes::{ProcessInventory, ProcessRecord};
use crate::collectors::{MetricsSnapshot, Sampler};
use crate::config::{AlertsConfig, MAX_HISTORY_CAPACITY, MAX_INTERVAL_SECS};
use crate::control::services::{ServiceController, ServiceRecord};
use crate::export::{ExportError, ExportSink};
use crate::history::{HistoryBuffer, Stats, DEFAULT_HISTORY_CAPACITY};
use crate::metrics::Metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DEFAULT_INTERVAL_SECS: u64 = 2;

/// Source of the two engine settings. Read at build time and on
/// [`MonitorEngine::reconfigure`].
pub trait SettingsProvider: Send + Sync {
    fn refresh_interval_seconds(&self) -> u64;
    fn history_capacity(&self) -> usize;
}

/// Charted metrics, each with its own history buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Ram,
    Gpu,
    Disk,
    Network,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Cpu,
        Metric::Ram,
        Metric::Gpu,
        Metric::Disk,
        Metric::Network,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Ram => "ram",
            Metric::Gpu => "gpu",
            Metric::Disk => "disk",
            Metric::Network => "network",
        }
    }

    /// Percent for everything except network, which is Mbps.
    pub fn value_of(self, snapshot: &MetricsSnapshot) -> f64 {
        match self {
            Metric::Cpu => snapshot.cpu_percent,
            Metric::Ram => snapshot.ram_percent,
            Metric::Gpu => snapshot.gpu_percent,
            Metric::Disk => snapshot.disk_percent,
            Metric::Network => snapshot.network_mbps,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Metric::Cpu),
            "ram" | "memory" => Ok(Metric::Ram),
            "gpu" => Ok(Metric::Gpu),
            "disk" => Ok(Metric::Disk),
            "network" | "net" => Ok(Metric::Network),
            other => Err(format!(
                "unknown metric '{other}' (expected cpu, ram, gpu, disk or network)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineStatus {
    Stopped,
    Running,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine needs a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("sampling tick failed: {0}")]
    TickFailed(String),
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Handler<T> = Box<dyn FnMut(&T) -> HandlerResult + Send>;

/// Subscribers of one feed. Every subscriber owns a queue and a dispatcher
/// task, so a slow or failing handler only delays itself.
struct Feed<T> {
    name: &'static str,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> Feed<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Arc<T>>>> {
        self.senders.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn add(
        &self,
        id: u64,
        handler: Handler<T>,
        runtime: &Handle,
        metrics: Option<Arc<Metrics>>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<T>>();
        let feed = self.name;
        let handler = Arc::new(Mutex::new(handler));
        runtime.spawn(async move {
            while let Some(value) = rx.recv().await {
                // handlers are synchronous and may block; keep them off the
                // runtime workers that drive the ticker
                let handler = Arc::clone(&handler);
                let call = tokio::task::spawn_blocking(move || {
                    let mut handler = handler.lock().unwrap_or_else(|p| p.into_inner());
                    catch_unwind(AssertUnwindSafe(|| (*handler)(value.as_ref())))
                });
                let failed = match call.await {
                    Ok(Ok(Ok(()))) => false,
                    Ok(Ok(Err(err))) => {
                        warn!(feed, subscription = id, error = %err, "subscriber returned an error");
                        true
                    }
                    Ok(Err(_)) => {
                        error!(feed, subscription = id, "subscriber panicked");
                        true
                    }
                    Err(err) => {
                        error!(feed, subscription = id, error = %err, "subscriber task failed");
                        true
                    }
                };
                if failed {
                    if let Some(m) = &metrics {
                        m.inc_subscriber_failure(feed);
                    }
                }
            }
            debug!(feed, subscription = id, "subscriber detached");
        });
        self.lock().insert(id, tx);
    }

    fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    fn broadcast(&self, value: Arc<T>) {
        self.lock().retain(|_, tx| tx.send(Arc::clone(&value)).is_ok());
    }
}

struct Histories {
    series: HashMap<Metric, HistoryBuffer<f64>>,
    snapshots: HistoryBuffer<MetricsSnapshot>,
}

impl Histories {
    fn new(capacity: usize) -> Self {
        Self {
            series: Metric::ALL
                .iter()
                .map(|m| (*m, HistoryBuffer::new(capacity)))
                .collect(),
            snapshots: HistoryBuffer::new(capacity),
        }
    }

    fn push(&mut self, snapshot: &MetricsSnapshot) {
        let capacity = self.snapshots.capacity();
        for metric in Metric::ALL {
            self.series
                .entry(metric)
                .or_insert_with(|| HistoryBuffer::new(capacity))
                .append(metric.value_of(snapshot));
        }
        self.snapshots.append(snapshot.clone());
    }

    fn buffer(&self, metric: Metric) -> HistoryBuffer<f64> {
        self.series
            .get(&metric)
            .cloned()
            .unwrap_or_else(|| HistoryBuffer::new(self.snapshots.capacity()))
    }

    fn resize(&mut self, capacity: usize) {
        for buf in self.series.values_mut() {
            *buf = buf.resized(capacity);
        }
        self.snapshots = self.snapshots.resized(capacity);
    }

    fn clear(&mut self) {
        for buf in self.series.values_mut() {
            buf.clear();
        }
        self.snapshots.clear();
    }
}

struct Inner {
    runtime: Handle,
    // held for a whole tick, so timer ticks and refresh_now never overlap
    sampler: Arc<tokio::sync::Mutex<Box<dyn Sampler>>>,
    histories: RwLock<Histories>,
    metrics_feed: Feed<MetricsSnapshot>,
    process_feed: Feed<Vec<ProcessRecord>>,
    service_feed: Feed<Vec<ServiceRecord>>,
    next_subscription: AtomicU64,
    inventory: Option<Arc<ProcessInventory>>,
    services: Option<ServiceController>,
    alerts: Option<Mutex<AlertEvaluator>>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Option<Arc<Metrics>>,
    tick_count: AtomicU64,
}

impl Inner {
    async fn tick(&self) -> Result<MetricsSnapshot, EngineError> {
        let mut sampler = Arc::clone(&self.sampler).lock_owned().await;
        let joined = tokio::task::spawn_blocking(move || {
            let snapshot = sampler.sample();
            (sampler, snapshot)
        })
        .await;
        let (guard, snapshot) = match joined {
            Ok(pair) => pair,
            Err(err) => {
                self.count_sample_error("sampler");
                return Err(EngineError::TickFailed(err.to_string()));
            }
        };

        self.histories.write().await.push(&snapshot);
        let ticks = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(m) = &self.metrics {
            m.update_from_snapshot(&snapshot);
        }

        self.metrics_feed.broadcast(Arc::new(snapshot.clone()));
        self.raise_alerts(&snapshot);
        self.poll_inventories().await;
        drop(guard);

        debug!(
            tick = ticks,
            cpu = snapshot.cpu_percent,
            ram = snapshot.ram_percent,
            "tick complete"
        );
        Ok(snapshot)
    }

    fn raise_alerts(&self, snapshot: &MetricsSnapshot) {
        let Some(evaluator) = &self.alerts else {
            return;
        };
        let now_unix = (snapshot.timestamp_ms / 1000) as i64;
        let alerts = evaluator
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .evaluate(snapshot, now_unix);

        for alert in &alerts {
            if let Some(m) = &self.metrics {
                m.inc_alert_raised(alert.kind.as_str());
            }
            if catch_unwind(AssertUnwindSafe(|| self.notifier.show_alert(alert))).is_err() {
                error!(kind = %alert.kind, "notification sink panicked");
            }
        }
    }

    async fn poll_inventories(&self) {
        if let Some(inventory) = &self.inventory {
            if !self.process_feed.is_empty() {
                let inventory = Arc::clone(inventory);
                match tokio::task::spawn_blocking(move || inventory.list()).await {
                    Ok(records) => self.process_feed.broadcast(Arc::new(records)),
                    Err(err) => {
                        warn!(error = %err, "process poll aborted");
                        self.count_sample_error("processes");
                    }
                }
            }
        }

        if let Some(services) = &self.services {
            if !self.service_feed.is_empty() {
                let services = services.clone();
                match tokio::task::spawn_blocking(move || services.list()).await {
                    Ok(Ok(records)) => self.service_feed.broadcast(Arc::new(records)),
                    Ok(Err(err)) => {
                        warn!(error = %err, "service poll failed");
                        self.count_sample_error("services");
                    }
                    Err(err) => {
                        warn!(error = %err, "service poll aborted");
                        self.count_sample_error("services");
                    }
                }
            }
        }
    }

    fn count_sample_error(&self, counter: &str) {
        if let Some(m) = &self.metrics {
            m.inc_sample_error(counter);
        }
    }
}

async fn run_loop(inner: Arc<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("sampling loop received stop signal");
                break;
            }
            _ = ticker.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(err) = inner.tick().await {
                    warn!(error = %err, "sampling tick failed");
                }
            }
        }
    }
}

struct Control {
    status: EngineStatus,
    interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Control {
    /// Signals the loop and hands back its task. An in-flight tick still
    /// finishes; no further tick starts.
    fn halt(&mut self) -> Option<JoinHandle<()>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        self.status = EngineStatus::Stopped;
        self.task.take()
    }
}

/// Periodic sampler with history and subscriber fan-out.
///
/// `Stopped -> Running -> Stopped`. Starting a running engine and stopping a
/// stopped one are no-ops. Dropping the engine stops it.
pub struct MonitorEngine {
    inner: Arc<Inner>,
    control: Mutex<Control>,
}

impl MonitorEngine {
    pub fn builder(sampler: Box<dyn Sampler>) -> EngineBuilder {
        EngineBuilder {
            sampler,
            interval_secs: DEFAULT_INTERVAL_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            alerts: None,
            metrics: None,
            inventory: None,
            services: None,
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn start(&self) {
        let mut ctl = self.control();
        if ctl.status == EngineStatus::Running {
            debug!("engine already running");
            return;
        }
        self.spawn_loop(&mut ctl);
    }

    fn spawn_loop(&self, ctl: &mut Control) {
        let (tx, rx) = watch::channel(false);
        let period = ctl.interval;
        let task = self
            .inner
            .runtime
            .spawn(run_loop(Arc::clone(&self.inner), period, rx));
        ctl.shutdown = Some(tx);
        ctl.task = Some(task);
        ctl.status = EngineStatus::Running;
        info!(interval_secs = period.as_secs(), "monitor engine started");
    }

    pub fn stop(&self) {
        let mut ctl = self.control();
        if ctl.status == EngineStatus::Stopped {
            return;
        }
        // the loop exits on its own once it sees the signal
        drop(ctl.halt());
        info!("monitor engine stopped");
    }

    /// Stops and waits for an in-flight tick to finish.
    pub async fn stop_and_wait(&self) {
        let task = {
            let mut ctl = self.control();
            if ctl.status == EngineStatus::Stopped {
                None
            } else {
                ctl.halt()
            }
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "sampling task ended abnormally");
            }
            info!("monitor engine stopped");
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.control().status
    }

    pub fn interval(&self) -> Duration {
        self.control().interval
    }

    /// Rebinds the tick interval. A running timer is restarted; history is
    /// kept.
    pub fn set_interval(&self, secs: u64) -> Result<(), EngineError> {
        let interval = interval_from_secs(secs)?;
        let mut ctl = self.control();
        if ctl.interval == interval {
            return Ok(());
        }
        ctl.interval = interval;
        if ctl.status == EngineStatus::Running {
            drop(ctl.halt());
            self.spawn_loop(&mut ctl);
        }
        info!(interval_secs = secs, "sampling interval changed");
        Ok(())
    }

    /// Rebuilds every buffer at the new capacity, keeping the newest samples.
    pub async fn set_history_capacity(&self, capacity: usize) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        self.inner.histories.write().await.resize(capacity);
        info!(capacity, "history capacity changed");
        Ok(())
    }

    pub async fn reconfigure(&self, settings: &dyn SettingsProvider) -> Result<(), EngineError> {
        let secs = settings.refresh_interval_seconds();
        let capacity = settings.history_capacity();
        interval_from_secs(secs)?;
        validate_capacity(capacity)?;

        self.set_history_capacity(capacity).await?;
        self.set_interval(secs)
    }

    pub fn tick_count(&self) -> u64 {
        self.inner.tick_count.load(Ordering::SeqCst)
    }

    /// Runs one tick now. Waits for a timer tick in progress to finish first.
    pub async fn refresh_now(&self) -> Result<MetricsSnapshot, EngineError> {
        self.inner.tick().await
    }

    pub async fn latest(&self) -> Option<MetricsSnapshot> {
        self.inner.histories.read().await.snapshots.latest().cloned()
    }

    pub async fn history(&self, metric: Metric) -> Vec<f64> {
        self.history_buffer(metric).await.snapshot()
    }

    pub async fn history_buffer(&self, metric: Metric) -> HistoryBuffer<f64> {
        self.inner.histories.read().await.buffer(metric)
    }

    pub async fn stats(&self, metric: Metric) -> Stats {
        self.history_buffer(metric).await.stats()
    }

    pub async fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.inner.histories.read().await.snapshots.snapshot()
    }

    pub async fn history_capacity(&self) -> usize {
        self.inner.histories.read().await.snapshots.capacity()
    }

    pub async fn clear_history(&self) {
        self.inner.histories.write().await.clear();
        info!("history cleared");
    }

    pub fn process_inventory(&self) -> Option<Arc<ProcessInventory>> {
        self.inner.inventory.clone()
    }

    pub fn service_controller(&self) -> Option<ServiceController> {
        self.inner.services.clone()
    }

    /// Hands the snapshot history to `sink` and returns how many were sent.
    pub async fn export_snapshots(&self, sink: &dyn ExportSink) -> Result<usize, ExportError> {
        let snapshots = self.snapshots().await;
        sink.export_metrics(&snapshots)?;
        Ok(snapshots.len())
    }

    /// Takes a fresh process listing and hands it to `sink`.
    pub async fn export_processes(&self, sink: &dyn ExportSink) -> Result<usize, ExportError> {
        let Some(inventory) = self.inner.inventory.clone() else {
            return Err(ExportError::Rejected(
                "no process inventory attached".to_string(),
            ));
        };
        let records = tokio::task::spawn_blocking(move || inventory.list())
            .await
            .map_err(|err| ExportError::Rejected(format!("process listing aborted: {err}")))?;
        sink.export_processes(&records)?;
        Ok(records.len())
    }

    /// Registers a handler for every tick's snapshot. Handlers run on their
    /// own task; errors and panics are logged and counted.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: FnMut(&MetricsSnapshot) -> HandlerResult + Send + 'static,
    {
        let id = self.next_id();
        self.inner.metrics_feed.add(
            id,
            Box::new(handler),
            &self.inner.runtime,
            self.inner.metrics.clone(),
        );
        SubscriptionHandle(id)
    }

    /// Process listings, polled only while at least one subscriber exists.
    pub fn subscribe_processes<F>(&self, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(&[ProcessRecord]) -> HandlerResult + Send + 'static,
    {
        let id = self.next_id();
        self.inner.process_feed.add(
            id,
            Box::new(move |records: &Vec<ProcessRecord>| handler(records.as_slice())),
            &self.inner.runtime,
            self.inner.metrics.clone(),
        );
        SubscriptionHandle(id)
    }

    /// Service listings, polled only while at least one subscriber exists.
    pub fn subscribe_services<F>(&self, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(&[ServiceRecord]) -> HandlerResult + Send + 'static,
    {
        let id = self.next_id();
        self.inner.service_feed.add(
            id,
            Box::new(move |records: &Vec<ServiceRecord>| handler(records.as_slice())),
            &self.inner.runtime,
            self.inner.metrics.clone(),
        );
        SubscriptionHandle(id)
    }

    /// Returns false when the handle was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let id = handle.0;
        self.inner.metrics_feed.remove(id)
            || self.inner.process_feed.remove(id)
            || self.inner.service_feed.remove(id)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_subscription.fetch_add(1, Ordering::SeqCst)
    }
}

impl Drop for MonitorEngine {
    fn drop(&mut self) {
        let ctl = self.control.get_mut().unwrap_or_else(|p| p.into_inner());
        drop(ctl.halt());
    }
}

pub struct EngineBuilder {
    sampler: Box<dyn Sampler>,
    interval_secs: u64,
    history_capacity: usize,
    alerts: Option<(AlertsConfig, Arc<dyn NotificationSink>)>,
    metrics: Option<Arc<Metrics>>,
    inventory: Option<Arc<ProcessInventory>>,
    services: Option<ServiceController>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: &dyn SettingsProvider) -> Self {
        self.interval_secs = settings.refresh_interval_seconds();
        self.history_capacity = settings.history_capacity();
        self
    }

    pub fn interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn alerts(mut self, cfg: AlertsConfig, notifier: Arc<dyn NotificationSink>) -> Self {
        self.alerts = Some((cfg, notifier));
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn process_inventory(mut self, inventory: Arc<ProcessInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn service_controller(mut self, services: ServiceController) -> Self {
        self.services = Some(services);
        self
    }

    /// Must be called inside a tokio runtime; the engine spawns onto it.
    pub fn build(self) -> Result<MonitorEngine, EngineError> {
        let runtime = Handle::try_current()?;
        let interval = interval_from_secs(self.interval_secs)?;
        validate_capacity(self.history_capacity)?;

        let (alerts, notifier) = match self.alerts {
            Some((cfg, notifier)) => (Some(Mutex::new(AlertEvaluator::new(cfg))), notifier),
            None => (None, Arc::new(LogNotifier) as Arc<dyn NotificationSink>),
        };

        let inner = Inner {
            runtime,
            sampler: Arc::new(tokio::sync::Mutex::new(self.sampler)),
            histories: RwLock::new(Histories::new(self.history_capacity)),
            metrics_feed: Feed::new("metrics"),
            process_feed: Feed::new("processes"),
            service_feed: Feed::new("services"),
            next_subscription: AtomicU64::new(1),
            inventory: self.inventory,
            services: self.services,
            alerts,
            notifier,
            metrics: self.metrics,
            tick_count: AtomicU64::new(0),
        };

        Ok(MonitorEngine {
            inner: Arc::new(inner),
            control: Mutex::new(Control {
                status: EngineStatus::Stopped,
                interval,
                shutdown: None,
                task: None,
            }),
        })
    }
}

fn interval_from_secs(secs: u64) -> Result<Duration, EngineError> {
    if !(1..=MAX_INTERVAL_SECS).contains(&secs) {
        return Err(EngineError::InvalidSetting(format!(
            "refresh interval must be in 1..={MAX_INTERVAL_SECS} seconds, got {secs}"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn validate_capacity(capacity: usize) -> Result<(), EngineError> {
    if !(1..=MAX_HISTORY_CAPACITY).contains(&capacity) {
        return Err(EngineError::InvalidSetting(format!(
            "history capacity must be in 1..={MAX_HISTORY_CAPACITY}, got {capacity}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertKind};
    use crate::collectors::testing::CountingSampler;
    use crate::control::services::{ServiceManager, ServiceState, StartMode};
    use crate::control::ControlError;
    use crate::export::JsonSink;
    use tokio::time::{sleep, timeout};

    fn engine_with(interval_secs: u64, capacity: usize) -> (MonitorEngine, Arc<AtomicU64>) {
        let sampler = CountingSampler::default();
        let calls = sampler.calls.clone();
        let engine = MonitorEngine::builder(Box::new(sampler))
            .interval_secs(interval_secs)
            .history_capacity(capacity)
            .build()
            .unwrap();
        (engine, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_runs_a_single_timer() {
        let (engine, calls) = engine_with(1, 60);
        engine.start();
        engine.start();
        assert_eq!(engine.status(), EngineStatus::Running);

        sleep(Duration::from_millis(4500)).await;
        assert_eq!(engine.tick_count(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_start_keeps_history() {
        let (engine, _) = engine_with(1, 60);
        engine.start();
        sleep(Duration::from_millis(2500)).await;
        engine.stop();
        engine.stop();
        assert_eq!(engine.status(), EngineStatus::Stopped);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.tick_count(), 3);
        assert_eq!(engine.history(Metric::Cpu).await, vec![1.0, 2.0, 3.0]);

        engine.start();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            engine.history(Metric::Cpu).await,
            vec![1.0, 2.0, 3.0, 4.0, 5.0]
        );
        engine.stop_and_wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_restarts_timer() {
        let (engine, _) = engine_with(1, 60);
        engine.start();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(engine.tick_count(), 2);

        engine.set_interval(3).unwrap();
        assert_eq!(engine.interval(), Duration::from_secs(3));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.tick_count(), 3);
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(engine.tick_count(), 4);
        assert_eq!(engine.history(Metric::Cpu).await.len(), 4);

        assert!(matches!(
            engine.set_interval(0),
            Err(EngineError::InvalidSetting(_))
        ));
    }

    #[tokio::test]
    async fn resize_keeps_newest_samples() {
        let (engine, _) = engine_with(1, 3);
        for _ in 0..5 {
            engine.refresh_now().await.unwrap();
        }
        assert_eq!(engine.history(Metric::Cpu).await, vec![3.0, 4.0, 5.0]);

        engine.set_history_capacity(2).await.unwrap();
        assert_eq!(engine.history_capacity().await, 2);
        let stats = engine.stats(Metric::Cpu).await;
        assert_eq!(stats.current, 5.0);
        assert_eq!(stats.min, 4.0);
        assert_eq!(stats.average, 4.5);
        assert_eq!(engine.snapshots().await.len(), 2);
        assert_eq!(engine.history(Metric::Ram).await, vec![50.0, 50.0]);

        engine.clear_history().await;
        assert!(engine.latest().await.is_none());
        assert_eq!(engine.stats(Metric::Cpu).await, Stats::default());
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_starve_others() {
        let (engine, _) = engine_with(1, 60);
        engine.subscribe(|_| panic!("handler bug"));
        engine.subscribe(|_| Err("rejected".into()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.subscribe(move |s| {
            tx.send(s.cpu_percent)?;
            Ok(())
        });

        engine.refresh_now().await.unwrap();
        engine.refresh_now().await.unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(1.0));
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(2.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_subscribers_keep_tick_cadence() {
        let (baseline, _) = engine_with(1, 60);
        let (engine, _) = engine_with(1, 60);

        // one blocked handler per runtime worker
        let mut releases = Vec::new();
        for _ in 0..2 {
            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            releases.push(release_tx);
            engine.subscribe(move |_| {
                let _ = release_rx.recv_timeout(Duration::from_secs(30));
                Ok(())
            });
        }
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        engine.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        baseline.start();
        engine.start();
        sleep(Duration::from_millis(2500)).await;
        baseline.stop_and_wait().await;
        engine.stop_and_wait().await;
        drop(releases);

        assert_eq!(baseline.tick_count(), 3);
        assert_eq!(engine.tick_count(), baseline.tick_count());
        let wait = Duration::from_secs(5);
        timeout(wait, async {
            while delivered.load(Ordering::SeqCst) < 3 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_handler_is_released() {
        let (engine, _) = engine_with(1, 60);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = engine.subscribe(move |s| {
            tx.send(s.cpu_percent)?;
            Ok(())
        });

        engine.refresh_now().await.unwrap();
        assert_eq!(rx.recv().await, Some(1.0));

        assert!(engine.unsubscribe(handle));
        assert!(!engine.unsubscribe(handle));
        engine.refresh_now().await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    struct CountingServices {
        lists: AtomicU64,
    }

    impl ServiceManager for CountingServices {
        fn list(&self) -> Result<Vec<ServiceRecord>, ControlError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ServiceRecord {
                name: "cron".to_string(),
                display_name: "Cron".to_string(),
                description: String::new(),
                state: ServiceState::Running,
                start_mode: StartMode::Automatic,
                process_name: None,
            }])
        }

        fn start(&self, _name: &str) -> Result<(), ControlError> {
            Ok(())
        }

        fn stop(&self, _name: &str) -> Result<(), ControlError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn services_polled_only_with_subscribers() {
        let manager = Arc::new(CountingServices {
            lists: AtomicU64::new(0),
        });
        let engine = MonitorEngine::builder(Box::new(CountingSampler::default()))
            .service_controller(ServiceController::new(manager.clone()))
            .build()
            .unwrap();

        engine.refresh_now().await.unwrap();
        assert_eq!(manager.lists.load(Ordering::SeqCst), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.subscribe_services(move |records| {
            tx.send(records.len())?;
            Ok(())
        });
        engine.refresh_now().await.unwrap();
        assert_eq!(manager.lists.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await, Some(1));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        alerts: Mutex<Vec<Alert>>,
    }

    impl NotificationSink for RecordingNotifier {
        fn show_alert(&self, alert: &Alert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    #[tokio::test]
    async fn threshold_breach_reaches_notifier_once_per_cooldown() {
        let notifier = Arc::new(RecordingNotifier::default());
        let metrics = Metrics::new().unwrap();
        let cfg = AlertsConfig {
            cpu_load_threshold_percent: 2.0,
            ..AlertsConfig::default()
        };
        let engine = MonitorEngine::builder(Box::new(CountingSampler::default()))
            .alerts(cfg, notifier.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        for _ in 0..3 {
            engine.refresh_now().await.unwrap();
        }

        let alerts = notifier.alerts.lock().unwrap().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::CpuLoad);
        assert_eq!(alerts[0].value, 2.0);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("hostpulse_alerts_raised_total{kind=\"cpu_load\"} 1"));
        assert!(text.contains("hostpulse_ticks_total 3"));
    }

    #[tokio::test]
    async fn exports_snapshot_history() {
        let (engine, _) = engine_with(1, 60);
        engine.refresh_now().await.unwrap();
        engine.refresh_now().await.unwrap();

        let sink = JsonSink::new(Vec::new());
        assert_eq!(engine.export_snapshots(&sink).await.unwrap(), 2);
        let parsed: serde_json::Value = serde_json::from_slice(&sink.into_inner()).unwrap();
        assert_eq!(parsed[1]["cpu_percent"], 2.0);

        let err = engine.export_processes(&JsonSink::new(Vec::new())).await;
        assert!(matches!(err, Err(ExportError::Rejected(_))));
    }

    #[tokio::test]
    async fn reconfigure_applies_both_settings() {
        struct Fixed;
        impl SettingsProvider for Fixed {
            fn refresh_interval_seconds(&self) -> u64 {
                5
            }
            fn history_capacity(&self) -> usize {
                10
            }
        }

        let (engine, _) = engine_with(1, 60);
        engine.reconfigure(&Fixed).await.unwrap();
        assert_eq!(engine.interval(), Duration::from_secs(5));
        assert_eq!(engine.history_capacity().await, 10);
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[test]
    fn build_requires_runtime() {
        let result = MonitorEngine::builder(Box::new(CountingSampler::default())).build();
        assert!(matches!(result, Err(EngineError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn rejects_zero_capacity() {
        let result = MonitorEngine::builder(Box::new(CountingSampler::default()))
            .history_capacity(0)
            .build();
        assert!(matches!(result, Err(EngineError::InvalidSetting(_))));
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("CPU".parse::<Metric>(), Ok(Metric::Cpu));
        assert_eq!("net".parse::<Metric>(), Ok(Metric::Network));
        assert!("fan".parse::<Metric>().is_err());
    }
}
