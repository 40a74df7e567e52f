pub mod policy;
pub mod process;
pub mod services;
pub mod sessions;
pub mod startup;

use crate::metrics::Metrics;
use thiserror::Error;
use tracing::{info, warn};

/// Failure of a control operation or an OS query behind one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is protected and cannot be modified")]
    ProtectedTarget(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("operating system call failed: {0}")]
    TransientOsFailure(String),
    #[error("instrumentation unavailable: {0}")]
    InstrumentationUnavailable(String),
    #[error("timed out: {0}")]
    TimedOut(String),
}

impl ControlError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "not_found",
            ControlError::ProtectedTarget(_) => "protected",
            ControlError::AccessDenied(_) => "access_denied",
            ControlError::TransientOsFailure(_) => "os_failure",
            ControlError::InstrumentationUnavailable(_) => "unavailable",
            ControlError::TimedOut(_) => "timeout",
        }
    }
}

/// Runs a blocking control operation off the async workers.
pub(crate) async fn run_blocking<T, F>(op: F) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ControlError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| ControlError::TransientOsFailure(format!("control task aborted: {err}")))?
}

pub(crate) fn report<T>(
    metrics: Option<&Metrics>,
    operation: &'static str,
    target: &str,
    result: &Result<T, ControlError>,
) {
    let outcome = match result {
        Ok(_) => {
            info!(operation, target, "control operation succeeded");
            "ok"
        }
        Err(err) => {
            warn!(operation, target, error = %err, "control operation failed");
            err.kind_label()
        }
    };
    if let Some(m) = metrics {
        m.inc_control_operation(operation, outcome);
    }
}
