// parsers are compiled everywhere so they stay tested off Windows
#![cfg_attr(not(windows), allow(dead_code))]

use super::SessionRecord;

#[cfg(windows)]
use super::SessionManager;
#[cfg(windows)]
use crate::control::ControlError;
#[cfg(windows)]
use crate::platform::run_tool;

/// Terminal Services backend driven through `query user` and `logoff`.
#[cfg(windows)]
pub struct QueryUserSessionManager;

#[cfg(windows)]
impl SessionManager for QueryUserSessionManager {
    fn list(&self) -> Result<Vec<SessionRecord>, ControlError> {
        let out = run_tool("query", &["user"])?;
        if !out.success {
            // exit code 1 with this message just means nobody is logged on
            if out.message().to_lowercase().contains("no user exists") {
                return Ok(Vec::new());
            }
            return Err(ControlError::TransientOsFailure(out.message()));
        }
        Ok(parse_query_user(&out.stdout))
    }

    fn log_off(&self, session_id: &str) -> Result<(), ControlError> {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ControlError::NotFound(format!("session {session_id}")));
        }
        let out = run_tool("logoff", &[session_id])?;
        if out.success {
            return Ok(());
        }
        let message = out.message();
        let lower = message.to_lowercase();
        if lower.contains("access is denied") {
            Err(ControlError::AccessDenied(format!("session {session_id}")))
        } else if lower.contains("not found") || lower.contains("invalid") {
            Err(ControlError::NotFound(format!("session {session_id}")))
        } else {
            Err(ControlError::TransientOsFailure(format!("session {session_id}: {message}")))
        }
    }
}

/// Parses `query user` output. Disconnected sessions have no session name,
/// so the column layout is detected per line.
pub(super) fn parse_query_user(text: &str) -> Vec<SessionRecord> {
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.contains("USERNAME"))
        .filter_map(|line| {
            let line = line.trim_start_matches(['>', ' ']);
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let username = tokens.first()?;
            let (session_type, id, state, idle) = if tokens.get(1)?.parse::<u32>().is_ok() {
                (None, tokens[1], tokens.get(2)?, tokens.get(3)?)
            } else {
                (Some(tokens[1]), *tokens.get(2)?, tokens.get(3)?, tokens.get(4)?)
            };
            Some(SessionRecord {
                username: username.to_string(),
                session_type: session_type
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| state.to_lowercase()),
                logon_time: None,
                idle_seconds: parse_idle(idle),
                session_id: id.to_string(),
            })
        })
        .collect()
}

/// `none`, `.`, `M`, `H:MM` or `D+H:MM`.
fn parse_idle(raw: &str) -> u64 {
    let (days, rest) = match raw.split_once('+') {
        Some((d, r)) => (d.parse::<u64>().unwrap_or(0), r),
        None => (0, raw),
    };
    let minutes = match rest.split_once(':') {
        Some((h, m)) => h.parse::<u64>().unwrap_or(0) * 60 + m.parse::<u64>().unwrap_or(0),
        None => rest.parse::<u64>().unwrap_or(0),
    };
    days * 86_400 + minutes * 60
}
