mod scm;
mod systemd;

use crate::control::{report, run_blocking, ControlError};
use crate::metrics::Metrics;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[cfg(windows)]
pub use scm::ScmServiceManager;
pub use systemd::SystemdServiceManager;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceState {
    Running,
    Stopped,
    StartPending,
    StopPending,
}

impl FromStr for ServiceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "running" => Ok(ServiceState::Running),
            "stopped" => Ok(ServiceState::Stopped),
            "startpending" => Ok(ServiceState::StartPending),
            "stoppending" => Ok(ServiceState::StopPending),
            other => Err(format!("unknown service state '{other}'")),
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::StartPending => "start-pending",
            ServiceState::StopPending => "stop-pending",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StartMode {
    Boot,
    System,
    Automatic,
    Manual,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub state: ServiceState,
    pub start_mode: StartMode,
    pub process_name: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RestartError {
    #[error("stop phase failed: {0}")]
    Stop(ControlError),
    #[error("start phase failed: {0}")]
    Start(ControlError),
}

/// OS service manager backend. All methods block.
pub trait ServiceManager: Send + Sync {
    fn list(&self) -> Result<Vec<ServiceRecord>, ControlError>;
    fn start(&self, name: &str) -> Result<(), ControlError>;
    fn stop(&self, name: &str) -> Result<(), ControlError>;
}

/// Backend for hosts without a supported service manager.
pub struct UnsupportedServiceManager;

impl ServiceManager for UnsupportedServiceManager {
    fn list(&self) -> Result<Vec<ServiceRecord>, ControlError> {
        Err(unsupported())
    }

    fn start(&self, _name: &str) -> Result<(), ControlError> {
        Err(unsupported())
    }

    fn stop(&self, _name: &str) -> Result<(), ControlError> {
        Err(unsupported())
    }
}

fn unsupported() -> ControlError {
    ControlError::InstrumentationUnavailable("no service manager on this platform".to_string())
}

pub fn filter_by_state(records: &[ServiceRecord], state: ServiceState) -> Vec<ServiceRecord> {
    records.iter().filter(|r| r.state == state).cloned().collect()
}

/// Case-insensitive match on name, display name or description.
pub fn filter_by_term(records: Vec<ServiceRecord>, term: &str) -> Vec<ServiceRecord> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| {
            r.name.to_lowercase().contains(&needle)
                || r.display_name.to_lowercase().contains(&needle)
                || r.description.to_lowercase().contains(&needle)
        })
        .collect()
}

#[derive(Clone)]
pub struct ServiceController {
    manager: Arc<dyn ServiceManager>,
    settle_delay: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ServiceController {
    pub fn new(manager: Arc<dyn ServiceManager>) -> Self {
        Self {
            manager,
            settle_delay: DEFAULT_SETTLE_DELAY,
            metrics: None,
        }
    }

    /// Controller for the host's native service manager.
    pub fn host() -> Self {
        #[cfg(target_os = "linux")]
        let manager: Arc<dyn ServiceManager> = Arc::new(SystemdServiceManager);
        #[cfg(windows)]
        let manager: Arc<dyn ServiceManager> = Arc::new(ScmServiceManager);
        #[cfg(not(any(target_os = "linux", windows)))]
        let manager: Arc<dyn ServiceManager> = Arc::new(UnsupportedServiceManager);
        Self::new(manager)
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// All services ordered by display name.
    pub fn list(&self) -> Result<Vec<ServiceRecord>, ControlError> {
        let mut records = self.manager.list()?;
        records.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    pub fn query(&self, name: &str) -> Result<ServiceRecord, ControlError> {
        self.manager
            .list()?
            .into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ControlError::NotFound(format!("service {name}")))
    }

    pub fn search(&self, term: &str) -> Result<Vec<ServiceRecord>, ControlError> {
        Ok(filter_by_term(self.list()?, term))
    }

    pub async fn start(&self, name: &str) -> Result<(), ControlError> {
        let result = self.start_inner(name).await;
        report(self.metrics.as_deref(), "service_start", name, &result);
        result
    }

    pub async fn stop(&self, name: &str) -> Result<(), ControlError> {
        let result = self.stop_inner(name).await;
        report(self.metrics.as_deref(), "service_stop", name, &result);
        result
    }

    /// Stop, wait for the settle delay, then start. Start is never attempted
    /// when stop fails.
    pub async fn restart(&self, name: &str) -> Result<(), RestartError> {
        let result = self.restart_inner(name).await;
        let flat = result.clone().map_err(|err| match err {
            RestartError::Stop(e) | RestartError::Start(e) => e,
        });
        report(self.metrics.as_deref(), "service_restart", name, &flat);
        result
    }

    async fn restart_inner(&self, name: &str) -> Result<(), RestartError> {
        self.stop_inner(name).await.map_err(RestartError::Stop)?;
        debug!(service = name, delay = ?self.settle_delay, "waiting before start");
        tokio::time::sleep(self.settle_delay).await;
        self.start_inner(name).await.map_err(RestartError::Start)
    }

    async fn start_inner(&self, name: &str) -> Result<(), ControlError> {
        let manager = self.manager.clone();
        let name = name.to_string();
        run_blocking(move || manager.start(&name)).await
    }

    async fn stop_inner(&self, name: &str) -> Result<(), ControlError> {
        let manager = self.manager.clone();
        let name = name.to_string();
        run_blocking(move || manager.stop(&name)).await
    }
}
