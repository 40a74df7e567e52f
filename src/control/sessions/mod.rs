mod loginctl;
mod query_user;

use crate::control::{report, run_blocking, ControlError};
use crate::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;

pub use loginctl::LoginctlSessionManager;
#[cfg(windows)]
pub use query_user::QueryUserSessionManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub username: String,
    pub session_type: String,
    /// Seconds since the Unix epoch, when the host reports it.
    pub logon_time: Option<u64>,
    pub idle_seconds: u64,
    pub session_id: String,
}

/// OS session backend. All methods block.
pub trait SessionManager: Send + Sync {
    fn list(&self) -> Result<Vec<SessionRecord>, ControlError>;
    fn log_off(&self, session_id: &str) -> Result<(), ControlError>;
}

pub struct UnsupportedSessionManager;

impl SessionManager for UnsupportedSessionManager {
    fn list(&self) -> Result<Vec<SessionRecord>, ControlError> {
        Err(unsupported())
    }

    fn log_off(&self, _session_id: &str) -> Result<(), ControlError> {
        Err(unsupported())
    }
}

fn unsupported() -> ControlError {
    ControlError::InstrumentationUnavailable("no session manager on this platform".to_string())
}

#[derive(Clone)]
pub struct SessionController {
    manager: Arc<dyn SessionManager>,
    metrics: Option<Arc<Metrics>>,
}

impl SessionController {
    pub fn new(manager: Arc<dyn SessionManager>) -> Self {
        Self {
            manager,
            metrics: None,
        }
    }

    pub fn host() -> Self {
        #[cfg(target_os = "linux")]
        let manager: Arc<dyn SessionManager> = Arc::new(LoginctlSessionManager);
        #[cfg(windows)]
        let manager: Arc<dyn SessionManager> = Arc::new(QueryUserSessionManager);
        #[cfg(not(any(target_os = "linux", windows)))]
        let manager: Arc<dyn SessionManager> = Arc::new(UnsupportedSessionManager);
        Self::new(manager)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>, ControlError> {
        self.manager.list()
    }

    /// Ends every session owned by `username` (case-insensitive). All
    /// sessions are attempted; the first failure is returned.
    pub async fn log_off(&self, username: &str) -> Result<(), ControlError> {
        let manager = self.manager.clone();
        let user = username.to_string();
        let result = run_blocking(move || {
            let sessions: Vec<SessionRecord> = manager
                .list()?
                .into_iter()
                .filter(|s| s.username.eq_ignore_ascii_case(&user))
                .collect();
            if sessions.is_empty() {
                return Err(ControlError::NotFound(format!("sessions of user {user}")));
            }

            let mut first_error = None;
            for session in &sessions {
                if let Err(err) = manager.log_off(&session.session_id) {
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
        .await;
        report(self.metrics.as_deref(), "log_off", username, &result);
        result
    }
}
