// parsers are compiled everywhere so they stay tested off Windows
#![cfg_attr(not(windows), allow(dead_code))]

use super::{ServiceRecord, ServiceState, StartMode};
use crate::control::ControlError;
use serde::Deserialize;

#[cfg(windows)]
use super::ServiceManager;
#[cfg(windows)]
use crate::platform::{run_powershell, run_tool};

#[cfg(windows)]
const LIST_SCRIPT: &str = "$procs = @{}; Get-Process | ForEach-Object { $procs[[int]$_.Id] = $_.ProcessName }; \
Get-CimInstance Win32_Service | ForEach-Object { [pscustomobject]@{ \
Name = $_.Name; DisplayName = $_.DisplayName; Description = $_.Description; \
State = $_.State; StartMode = $_.StartMode; \
ProcessName = if ($_.ProcessId -gt 0) { $procs[[int]$_.ProcessId] } else { $null } } } | ConvertTo-Json -Compress";

/// Windows Service Control Manager backend: CIM for listing, `sc.exe` for
/// control.
#[cfg(windows)]
pub struct ScmServiceManager;

#[cfg(windows)]
impl ServiceManager for ScmServiceManager {
    fn list(&self) -> Result<Vec<ServiceRecord>, ControlError> {
        let out = run_powershell(LIST_SCRIPT)?;
        if !out.success {
            return Err(ControlError::TransientOsFailure(out.message()));
        }
        parse_cim_services(&out.stdout)
    }

    fn start(&self, name: &str) -> Result<(), ControlError> {
        sc("start", name)
    }

    fn stop(&self, name: &str) -> Result<(), ControlError> {
        sc("stop", name)
    }
}

#[cfg(windows)]
fn sc(verb: &str, name: &str) -> Result<(), ControlError> {
    if name.trim().is_empty() || name.contains(['"', '&', '|']) {
        return Err(ControlError::NotFound(format!("service {name}")));
    }
    let out = run_tool("sc.exe", &[verb, name])?;
    classify_sc(verb, name, out.code, &out.message())
}

/// Maps `sc.exe` exit codes. Starting a running service or stopping a
/// stopped one counts as success.
pub(super) fn classify_sc(
    verb: &str,
    name: &str,
    code: Option<i32>,
    message: &str,
) -> Result<(), ControlError> {
    match (verb, code) {
        (_, Some(0)) => Ok(()),
        ("start", Some(1056)) | ("stop", Some(1062)) => Ok(()),
        (_, Some(5)) => Err(ControlError::AccessDenied(format!("service {name}"))),
        (_, Some(1060)) => Err(ControlError::NotFound(format!("service {name}"))),
        _ => Err(ControlError::TransientOsFailure(format!(
            "service {name}: {}",
            message.lines().find(|l| !l.trim().is_empty()).unwrap_or(message).trim()
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CimService {
    name: String,
    display_name: Option<String>,
    description: Option<String>,
    state: Option<String>,
    start_mode: Option<String>,
    process_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<CimService>),
    One(CimService),
}

pub(super) fn parse_cim_services(json: &str) -> Result<Vec<ServiceRecord>, ControlError> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany = serde_json::from_str(trimmed).map_err(|err| {
        ControlError::TransientOsFailure(format!("unexpected service listing: {err}"))
    })?;
    let items = match parsed {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    };

    Ok(items
        .into_iter()
        .map(|s| ServiceRecord {
            display_name: s.display_name.unwrap_or_else(|| s.name.clone()),
            description: s.description.unwrap_or_default(),
            state: map_state(s.state.as_deref().unwrap_or_default()),
            start_mode: map_start_mode(s.start_mode.as_deref().unwrap_or_default()),
            process_name: s.process_name.filter(|p| !p.is_empty()),
            name: s.name,
        })
        .collect())
}

fn map_state(raw: &str) -> ServiceState {
    match raw.to_ascii_lowercase().as_str() {
        "running" => ServiceState::Running,
        "start pending" | "continue pending" => ServiceState::StartPending,
        "stop pending" | "pause pending" => ServiceState::StopPending,
        _ => ServiceState::Stopped,
    }
}

fn map_start_mode(raw: &str) -> StartMode {
    match raw.to_ascii_lowercase().as_str() {
        "boot" => StartMode::Boot,
        "system" => StartMode::System,
        "auto" | "automatic" => StartMode::Automatic,
        "disabled" => StartMode::Disabled,
        _ => StartMode::Manual,
    }
}
