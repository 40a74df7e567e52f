use super::{SessionManager, SessionRecord};
use crate::control::ControlError;
use crate::platform::run_tool;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// systemd-logind backend driven through `loginctl`.
pub struct LoginctlSessionManager;

impl SessionManager for LoginctlSessionManager {
    fn list(&self) -> Result<Vec<SessionRecord>, ControlError> {
        let out = run_tool("loginctl", &["list-sessions", "--no-legend", "--no-pager"])?;
        if !out.success {
            return Err(ControlError::TransientOsFailure(out.message()));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(parse_session_list(&out.stdout)
            .into_iter()
            .map(|(id, user)| {
                let props = show_session(&id);
                session_from(id, user, &props, now)
            })
            .collect())
    }

    fn log_off(&self, session_id: &str) -> Result<(), ControlError> {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ControlError::NotFound(format!("session {session_id}")));
        }
        let out = run_tool("loginctl", &["--no-ask-password", "terminate-session", session_id])?;
        if out.success {
            return Ok(());
        }
        Err(classify_failure(session_id, &out.message()))
    }
}

const SHOW_PROPS: [&str; 8] = [
    "-p",
    "Type",
    "-p",
    "Timestamp",
    "-p",
    "IdleHint",
    "-p",
    "IdleSinceHint",
];

fn show_session(id: &str) -> HashMap<String, String> {
    let mut args = vec!["show-session", id, "--timestamp=unix"];
    args.extend(SHOW_PROPS);
    // older systemd lacks --timestamp; fall back to its default format
    let out = match run_tool("loginctl", &args) {
        Ok(out) if out.success => Some(out),
        _ => {
            let mut args = vec!["show-session", id];
            args.extend(SHOW_PROPS);
            run_tool("loginctl", &args).ok().filter(|o| o.success)
        }
    };
    out.map(|o| parse_properties(&o.stdout)).unwrap_or_default()
}

/// `(session id, user)` pairs from `loginctl list-sessions --no-legend`.
pub(super) fn parse_session_list(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let _uid = parts.next()?;
            let user = parts.next()?;
            Some((id.to_string(), user.to_string()))
        })
        .collect()
}

pub(super) fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Seconds since the epoch from `@<secs>` or a raw microsecond count.
fn parse_timestamp(raw: &str) -> Option<u64> {
    if let Some(secs) = raw.strip_prefix('@') {
        return secs.split('.').next()?.parse().ok();
    }
    raw.parse::<u64>().ok().filter(|&v| v > 0).map(|usec| usec / 1_000_000)
}

pub(super) fn session_from(
    session_id: String,
    username: String,
    props: &HashMap<String, String>,
    now_secs: u64,
) -> SessionRecord {
    let idle = props.get("IdleHint").map(|v| v == "yes").unwrap_or(false);
    let idle_seconds = if idle {
        props
            .get("IdleSinceHint")
            .and_then(|v| parse_timestamp(v))
            .map(|since| now_secs.saturating_sub(since))
            .unwrap_or(0)
    } else {
        0
    };

    SessionRecord {
        username,
        session_type: props
            .get("Type")
            .filter(|t| !t.is_empty())
            .cloned()
            .unwrap_or_else(|| "unspecified".to_string()),
        logon_time: props.get("Timestamp").and_then(|v| parse_timestamp(v)),
        idle_seconds,
        session_id,
    }
}

fn classify_failure(session_id: &str, message: &str) -> ControlError {
    let lower = message.to_lowercase();
    if lower.contains("no session") || lower.contains("not found") {
        ControlError::NotFound(format!("session {session_id}"))
    } else if lower.contains("access denied")
        || lower.contains("authentication")
        || lower.contains("permission denied")
    {
        ControlError::AccessDenied(format!("session {session_id}: {message}"))
    } else {
        ControlError::TransientOsFailure(format!("session {session_id}: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_old_and_new_list_formats() {
        let old = "     2 1000 alice seat0 tty2\n    c1  120 gdm   seat0\n";
        let new = "3 1001 bob - 2211 user pts/0 no -\n";
        assert_eq!(
            parse_session_list(old),
            vec![
                ("2".to_string(), "alice".to_string()),
                ("c1".to_string(), "gdm".to_string())
            ]
        );
        assert_eq!(parse_session_list(new), vec![("3".to_string(), "bob".to_string())]);
    }

    #[test]
    fn builds_record_from_properties() {
        let props = parse_properties(
            "Type=wayland\nTimestamp=@1700000000\nIdleHint=yes\nIdleSinceHint=@1700000900\n",
        );
        let record = session_from("2".into(), "alice".into(), &props, 1_700_001_000);
        assert_eq!(record.session_type, "wayland");
        assert_eq!(record.logon_time, Some(1_700_000_000));
        assert_eq!(record.idle_seconds, 100);
    }

    #[test]
    fn active_session_has_no_idle_time() {
        let props = parse_properties("Type=tty\nIdleHint=no\nIdleSinceHint=1700000000000000\n");
        let record = session_from("5".into(), "bob".into(), &props, 1_800_000_000);
        assert_eq!(record.idle_seconds, 0);
        assert_eq!(record.logon_time, None);
    }

    #[test]
    fn missing_properties_fall_back() {
        let record = session_from("7".into(), "carol".into(), &HashMap::new(), 10);
        assert_eq!(record.session_type, "unspecified");
        assert_eq!(record.idle_seconds, 0);
    }

    #[test]
    fn raw_microsecond_timestamps() {
        assert_eq!(parse_timestamp("1700000000123456"), Some(1_700_000_000));
        assert_eq!(parse_timestamp("0"), None);
        assert_eq!(parse_timestamp("Thu 2023-11-14 22:13:20 UTC"), None);
    }

    #[test]
    fn rejects_odd_session_ids() {
        let mgr = LoginctlSessionManager;
        assert!(matches!(mgr.log_off("--all"), Err(ControlError::NotFound(_))));
    }
}
