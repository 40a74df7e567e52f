// parsers are compiled everywhere so they stay tested off Windows
#![cfg_attr(not(windows), allow(dead_code))]

use std::collections::HashMap;

#[cfg(windows)]
use super::{StartupEntry, StartupLocation, StartupSource};
#[cfg(windows)]
use crate::control::ControlError;
#[cfg(windows)]
use crate::platform::run_tool;

const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";
const APPROVED_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Explorer\StartupApproved\Run";

/// `Run` keys of HKCU and HKLM, read through `reg query`. Task Manager keeps
/// the enabled flag in the matching `StartupApproved\Run` key.
#[cfg(windows)]
pub struct RegistryRunSource;

#[cfg(windows)]
impl StartupSource for RegistryRunSource {
    fn list(&self) -> Result<Vec<StartupEntry>, ControlError> {
        let mut entries = Vec::new();
        for (hive, location) in [("HKCU", StartupLocation::User), ("HKLM", StartupLocation::System)] {
            let run_key = format!(r"{hive}\{RUN_KEY}");
            let approved = query_key(&format!(r"{hive}\{APPROVED_KEY}"))?
                .map(|text| parse_approved(&text))
                .unwrap_or_default();
            let Some(text) = query_key(&run_key)? else {
                continue;
            };
            for value in parse_reg_values(&text) {
                if !matches!(value.kind.as_str(), "REG_SZ" | "REG_EXPAND_SZ") || value.data.is_empty() {
                    continue;
                }
                let enabled = approved
                    .get(&value.name.to_lowercase())
                    .copied()
                    .unwrap_or(true);
                entries.push(StartupEntry {
                    name: value.name,
                    command: value.data,
                    location,
                    origin: run_key.clone(),
                    enabled,
                });
            }
        }
        Ok(entries)
    }
}

/// `None` when the key does not exist.
#[cfg(windows)]
fn query_key(key: &str) -> Result<Option<String>, ControlError> {
    let out = run_tool("reg", &["query", key])?;
    if out.success {
        return Ok(Some(out.stdout));
    }
    let message = out.message();
    if message.to_lowercase().contains("unable to find") {
        Ok(None)
    } else if message.to_lowercase().contains("access is denied") {
        Err(ControlError::AccessDenied(key.to_string()))
    } else {
        Err(ControlError::TransientOsFailure(format!("reg query {key}: {message}")))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) struct RegValue {
    pub name: String,
    pub kind: String,
    pub data: String,
}

/// Parses the value lines of `reg query <key>`: four-space separated
/// name, type and data. The key header and subkey lines are skipped.
pub(super) fn parse_reg_values(text: &str) -> Vec<RegValue> {
    text.lines()
        .filter(|line| line.starts_with(' '))
        .filter_map(|line| {
            let line = line.trim_start();
            let type_at = line.find("    REG_")?;
            let name = line[..type_at].trim();
            let rest = line[type_at..].trim_start();
            let (kind, data) = match rest.split_once("    ") {
                Some((kind, data)) => (kind, data.trim()),
                None => (rest.trim(), ""),
            };
            Some(RegValue {
                // the unnamed default value
                name: if name == "(Default)" { String::new() } else { name.to_string() },
                kind: kind.to_string(),
                data: data.to_string(),
            })
        })
        .filter(|v| !v.name.is_empty())
        .collect()
}

/// Lower-cased value name to enabled flag. The first byte of each
/// `REG_BINARY` value is even when enabled and odd when disabled.
pub(super) fn parse_approved(text: &str) -> HashMap<String, bool> {
    parse_reg_values(text)
        .into_iter()
        .filter(|v| v.kind == "REG_BINARY")
        .filter_map(|v| {
            let first = u8::from_str_radix(v.data.get(..2)?, 16).ok()?;
            Some((v.name.to_lowercase(), first & 1 == 0))
        })
        .collect()
}
