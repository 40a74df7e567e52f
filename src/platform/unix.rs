use crate::collectors::processes::PriorityClass;
use crate::control::ControlError;
use std::io;

#[cfg(target_os = "linux")]
use super::SchedInfo;
#[cfg(target_os = "linux")]
use std::collections::HashMap;

pub fn terminate(pid: u32) -> Result<(), ControlError> {
    signal(pid, libc::SIGKILL)
}

/// SIGSTOP on an already stopped process is a no-op, which keeps suspend
/// idempotent.
pub fn suspend(pid: u32) -> Result<(), ControlError> {
    signal(pid, libc::SIGSTOP)
}

pub fn resume(pid: u32) -> Result<(), ControlError> {
    signal(pid, libc::SIGCONT)
}

pub fn set_priority(pid: u32, class: PriorityClass) -> Result<(), ControlError> {
    let target = to_pid_t(pid)?;
    // SAFETY: plain syscall on a pid value; no memory is shared.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, target as libc::id_t, class.nice()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(map_errno(io::Error::last_os_error(), pid))
    }
}

fn signal(pid: u32, sig: libc::c_int) -> Result<(), ControlError> {
    let target = to_pid_t(pid)?;
    // SAFETY: kill(2) with a positive pid only addresses that process.
    let rc = unsafe { libc::kill(target, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(map_errno(io::Error::last_os_error(), pid))
    }
}

fn to_pid_t(pid: u32) -> Result<libc::pid_t, ControlError> {
    // pid 0 and negative values address process groups
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ControlError::NotFound(format!("process {pid}"))),
    }
}

fn map_errno(err: io::Error, pid: u32) -> ControlError {
    match err.raw_os_error() {
        Some(libc::ESRCH) => ControlError::NotFound(format!("process {pid}")),
        Some(libc::EPERM) | Some(libc::EACCES) => {
            ControlError::AccessDenied(format!("process {pid}: {err}"))
        }
        _ => ControlError::TransientOsFailure(format!("process {pid}: {err}")),
    }
}

#[cfg(target_os = "linux")]
pub fn sched_info() -> HashMap<u32, SchedInfo> {
    let mut out = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // processes exit between readdir and read; skip them
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(info) = parse_proc_stat(&stat) {
            out.insert(pid, info);
        }
    }
    out
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
#[cfg(target_os = "linux")]
pub(crate) fn parse_proc_stat(stat: &str) -> Option<SchedInfo> {
    let close = stat.rfind(')')?;
    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    // fields[0] is the state (field 3 in proc(5)); nice is 19, num_threads 20
    let nice: i32 = fields.get(16)?.parse().ok()?;
    let threads: u32 = fields.get(17)?.parse().ok()?;
    Some(SchedInfo {
        threads,
        priority: Some(PriorityClass::from_nice(nice)),
    })
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_with_awkward_name() {
        let stat = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 3 0 0 20 10 7 0 12345 1000 50";
        let info = parse_proc_stat(stat).unwrap();
        assert_eq!(info.threads, 7);
        assert_eq!(info.priority, Some(PriorityClass::BelowNormal));
    }

    #[test]
    fn truncated_stat_is_rejected() {
        assert!(parse_proc_stat("1 (init) S 0 1").is_none());
        assert!(parse_proc_stat("garbage").is_none());
    }

    #[test]
    fn reads_own_process() {
        let map = sched_info();
        let me = map.get(&std::process::id()).unwrap();
        assert!(me.threads >= 1);
    }

    #[test]
    fn pid_zero_is_not_signalled() {
        assert!(matches!(terminate(0), Err(ControlError::NotFound(_))));
    }
}
