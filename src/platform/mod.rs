//! Thin OS layer: signals, thread suspension, scheduling info and external
//! tool invocation. Everything above this module is platform neutral.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use crate::collectors::processes::PriorityClass;
use crate::control::ControlError;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for control tools such as systemctl or sc.exe.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const TOOL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(unix)]
pub use unix::{resume, set_priority, suspend, terminate};
#[cfg(windows)]
pub use windows::{resume, set_priority, suspend, terminate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedInfo {
    pub threads: u32,
    pub priority: Option<PriorityClass>,
}

/// Thread count and priority class per PID. Empty where the host offers no
/// cheap way to read them.
pub fn sched_info() -> HashMap<u32, SchedInfo> {
    #[cfg(target_os = "linux")]
    {
        unix::sched_info()
    }
    #[cfg(windows)]
    {
        windows::sched_info()
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        HashMap::new()
    }
}

#[cfg(not(any(unix, windows)))]
pub fn terminate(pid: u32) -> Result<(), ControlError> {
    Err(unsupported(pid))
}

#[cfg(not(any(unix, windows)))]
pub fn suspend(pid: u32) -> Result<(), ControlError> {
    Err(unsupported(pid))
}

#[cfg(not(any(unix, windows)))]
pub fn resume(pid: u32) -> Result<(), ControlError> {
    Err(unsupported(pid))
}

#[cfg(not(any(unix, windows)))]
pub fn set_priority(pid: u32, _class: PriorityClass) -> Result<(), ControlError> {
    Err(unsupported(pid))
}

#[cfg(not(any(unix, windows)))]
fn unsupported(pid: u32) -> ControlError {
    ControlError::InstrumentationUnavailable(format!("process control for pid {pid}"))
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stderr when present, stdout otherwise; tools disagree on where errors go.
    pub fn message(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

/// Runs an external tool, bounded by [`TOOL_TIMEOUT`]. A missing binary
/// means the instrumentation is not present on this host.
pub fn run_tool(program: &str, args: &[&str]) -> Result<ToolOutput, ControlError> {
    run_tool_timeout(program, args, TOOL_TIMEOUT)
}

/// Runs an external tool and kills it once `timeout` has passed.
pub fn run_tool_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ToolOutput, ControlError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, err))?;

    // drained on their own threads so a chatty tool never fills a pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ControlError::TimedOut(format!(
                    "{program} did not finish within {}",
                    humantime::format_duration(timeout)
                )));
            }
            Ok(None) => thread::sleep(TOOL_POLL_INTERVAL),
            Err(err) => {
                let _ = child.kill();
                return Err(ControlError::TransientOsFailure(format!("{program}: {err}")));
            }
        }
    };

    Ok(ToolOutput {
        success: status.success(),
        code: status.code(),
        stdout: decode_cmd_stdout(&collect(stdout)),
        stderr: decode_cmd_stdout(&collect(stderr)),
    })
}

fn spawn_error(program: &str, err: io::Error) -> ControlError {
    match err.kind() {
        ErrorKind::NotFound => {
            ControlError::InstrumentationUnavailable(format!("{program} is not installed"))
        }
        ErrorKind::PermissionDenied => ControlError::AccessDenied(format!("{program}: {err}")),
        _ => ControlError::TransientOsFailure(format!("{program}: {err}")),
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(windows)]
pub fn run_powershell(script: &str) -> Result<ToolOutput, ControlError> {
    let wrapped_script = format!(
        "[Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); $OutputEncoding=[System.Text.UTF8Encoding]::new($false); {script}"
    );
    match run_tool("powershell", &["-NoProfile", "-Command", &wrapped_script]) {
        Err(ControlError::InstrumentationUnavailable(_)) => run_tool(
            r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
            &["-NoProfile", "-Command", &wrapped_script],
        ),
        other => other,
    }
}

/// Console tools on Windows may emit UTF-16LE; everything else is UTF-8.
pub fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

pub fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
