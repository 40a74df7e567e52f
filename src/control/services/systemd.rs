use super::{ServiceManager, ServiceRecord, ServiceState, StartMode};
use crate::control::ControlError;
use crate::platform::{run_tool, ToolOutput};
use std::collections::HashMap;

/// systemd backend driven through `systemctl`.
pub struct SystemdServiceManager;

impl ServiceManager for SystemdServiceManager {
    fn list(&self) -> Result<Vec<ServiceRecord>, ControlError> {
        let units = systemctl(&[
            "list-units",
            "--type=service",
            "--all",
            "--no-legend",
            "--no-pager",
            "--plain",
        ])?;
        if !units.success {
            return Err(ControlError::TransientOsFailure(units.message()));
        }

        // start modes are decoration; a failure here only loses that column
        let modes = match systemctl(&["list-unit-files", "--type=service", "--no-legend", "--no-pager"]) {
            Ok(out) if out.success => parse_unit_files(&out.stdout),
            _ => HashMap::new(),
        };

        Ok(parse_units(&units.stdout, &modes))
    }

    fn start(&self, name: &str) -> Result<(), ControlError> {
        control("start", name)
    }

    fn stop(&self, name: &str) -> Result<(), ControlError> {
        control("stop", name)
    }
}

fn systemctl(args: &[&str]) -> Result<ToolOutput, ControlError> {
    run_tool("systemctl", args)
}

fn control(verb: &str, name: &str) -> Result<(), ControlError> {
    if name.trim().is_empty() || name.starts_with('-') {
        return Err(ControlError::NotFound(format!("service {name}")));
    }
    let unit = unit_name(name);
    let out = systemctl(&["--no-ask-password", verb, &unit])?;
    if out.success {
        return Ok(());
    }
    Err(classify_failure(name, out.code, &out.message()))
}

fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

pub(super) fn classify_failure(name: &str, code: Option<i32>, message: &str) -> ControlError {
    let lower = message.to_lowercase();
    if code == Some(5)
        || lower.contains("not found")
        || lower.contains("not loaded")
        || lower.contains("does not exist")
    {
        ControlError::NotFound(format!("service {name}"))
    } else if lower.contains("access denied")
        || lower.contains("authentication")
        || lower.contains("permission denied")
        || lower.contains("not permitted")
    {
        ControlError::AccessDenied(format!("service {name}: {message}"))
    } else {
        ControlError::TransientOsFailure(format!("service {name}: {message}"))
    }
}

/// Parses `systemctl list-units --plain --no-legend` output.
pub(super) fn parse_units(text: &str, modes: &HashMap<String, StartMode>) -> Vec<ServiceRecord> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start_matches(|c: char| c == '●' || c == '*' || c.is_whitespace());
            let mut parts = line.split_whitespace();
            let unit = parts.next()?;
            let load = parts.next()?;
            let active = parts.next()?;
            let sub = parts.next()?;
            let description = parts.collect::<Vec<_>>().join(" ");
            if load == "not-found" {
                return None;
            }

            let name = unit.strip_suffix(".service").unwrap_or(unit).to_string();
            let state = match (active, sub) {
                ("active", _) => ServiceState::Running,
                ("activating", _) | ("reloading", _) => ServiceState::StartPending,
                ("deactivating", _) => ServiceState::StopPending,
                _ => ServiceState::Stopped,
            };
            let start_mode = modes.get(unit).copied().unwrap_or(StartMode::Manual);

            Some(ServiceRecord {
                display_name: if description.is_empty() {
                    name.clone()
                } else {
                    description.clone()
                },
                name,
                description,
                state,
                start_mode,
                process_name: None,
            })
        })
        .collect()
}

/// Parses `systemctl list-unit-files --no-legend` output into start modes.
pub(super) fn parse_unit_files(text: &str) -> HashMap<String, StartMode> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let unit = parts.next()?;
            let mode = match parts.next()? {
                "enabled" | "enabled-runtime" | "alias" | "linked" => StartMode::Automatic,
                "masked" | "masked-runtime" => StartMode::Disabled,
                _ => StartMode::Manual,
            };
            Some((unit.to_string(), mode))
        })
        .collect()
}
