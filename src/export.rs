use crate::collectors::processes::ProcessRecord;
use crate::collectors::MetricsSnapshot;
use std::io::Write;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("export encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("export rejected: {0}")]
    Rejected(String),
}

/// Destination for exported history and process tables. File formats live
/// behind this trait.
pub trait ExportSink: Send + Sync {
    fn export_metrics(&self, snapshots: &[MetricsSnapshot]) -> Result<(), ExportError>;
    fn export_processes(&self, records: &[ProcessRecord]) -> Result<(), ExportError>;
}

/// Writes each export as a pretty-printed JSON array.
pub struct JsonSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|p| p.into_inner())
    }

    fn write_json<T: serde::Serialize>(&self, value: &T) -> Result<(), ExportError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| ExportError::Rejected("writer poisoned".to_string()))?;
        serde_json::to_writer_pretty(&mut *out, value)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> ExportSink for JsonSink<W> {
    fn export_metrics(&self, snapshots: &[MetricsSnapshot]) -> Result<(), ExportError> {
        self.write_json(&snapshots)
    }

    fn export_processes(&self, records: &[ProcessRecord]) -> Result<(), ExportError> {
        self.write_json(&records)
    }
}
