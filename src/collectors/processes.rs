use crate::control::policy::ProtectionPolicy;
use crate::control::ControlError;
use crate::platform;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use sysinfo::{Pid, PidExt, Process, ProcessExt, ProcessStatus, System, SystemExt, UserExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 6] = [
        PriorityClass::Idle,
        PriorityClass::BelowNormal,
        PriorityClass::Normal,
        PriorityClass::AboveNormal,
        PriorityClass::High,
        PriorityClass::RealTime,
    ];

    /// Unix nice value used when applying this class.
    pub fn nice(self) -> i32 {
        match self {
            PriorityClass::Idle => 19,
            PriorityClass::BelowNormal => 10,
            PriorityClass::Normal => 0,
            PriorityClass::AboveNormal => -5,
            PriorityClass::High => -10,
            PriorityClass::RealTime => -20,
        }
    }

    pub fn from_nice(nice: i32) -> Self {
        match nice {
            n if n >= 15 => PriorityClass::Idle,
            n if n >= 5 => PriorityClass::BelowNormal,
            n if n > -5 => PriorityClass::Normal,
            n if n > -10 => PriorityClass::AboveNormal,
            n if n > -20 => PriorityClass::High,
            _ => PriorityClass::RealTime,
        }
    }

    /// Maps a Windows base priority (4, 6, 8, 10, 13, 24) to its class.
    pub fn from_base_priority(base: i32) -> Self {
        match base {
            b if b <= 4 => PriorityClass::Idle,
            b if b <= 6 => PriorityClass::BelowNormal,
            b if b <= 8 => PriorityClass::Normal,
            b if b <= 10 => PriorityClass::AboveNormal,
            b if b < 24 => PriorityClass::High,
            _ => PriorityClass::RealTime,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::Idle => "idle",
            PriorityClass::BelowNormal => "below-normal",
            PriorityClass::Normal => "normal",
            PriorityClass::AboveNormal => "above-normal",
            PriorityClass::High => "high",
            PriorityClass::RealTime => "realtime",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        PriorityClass::ALL
            .into_iter()
            .find(|c| c.as_str().replace('-', "") == wanted)
            .ok_or_else(|| {
                format!("unknown priority class '{s}' (expected idle, below-normal, normal, above-normal, high or realtime)")
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Running,
    Suspended,
    Terminated,
}

impl From<ProcessStatus> for ProcessState {
    fn from(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Stop | ProcessStatus::Tracing => ProcessState::Suspended,
            ProcessStatus::Zombie | ProcessStatus::Dead => ProcessState::Terminated,
            _ => ProcessState::Running,
        }
    }
}

/// PID plus start time. PIDs are recycled; the pair is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub exe_path: Option<String>,
    pub user: Option<String>,
    pub command_line: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub thread_count: u32,
    pub start_time: u64,
    pub priority: Option<PriorityClass>,
    pub state: ProcessState,
    pub is_system_process: bool,
}

impl ProcessRecord {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Cpu,
    Memory,
    Name,
    Pid,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(SortKey::Cpu),
            "memory" | "mem" => Ok(SortKey::Memory),
            "name" => Ok(SortKey::Name),
            "pid" => Ok(SortKey::Pid),
            other => Err(format!("unknown sort key '{other}' (expected cpu, memory, name or pid)")),
        }
    }
}

pub fn sort_records(records: &mut [ProcessRecord], key: SortKey, descending: bool) {
    records.sort_by(|a, b| {
        let ord = match key {
            SortKey::Cpu => a
                .cpu_percent
                .partial_cmp(&b.cpu_percent)
                .unwrap_or(Ordering::Equal),
            SortKey::Memory => a.memory_bytes.cmp(&b.memory_bytes),
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortKey::Pid => a.pid.cmp(&b.pid),
        };
        let ord = if descending { ord.reverse() } else { ord };
        ord.then(a.pid.cmp(&b.pid))
    });
}

/// Case-insensitive name substring match. An empty term matches everything.
pub fn filter_by_name(records: Vec<ProcessRecord>, term: &str) -> Vec<ProcessRecord> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| r.name.to_lowercase().contains(&needle))
        .collect()
}

/// Point-in-time enumeration of running processes.
pub struct ProcessInventory {
    system: Mutex<System>,
    policy: Arc<ProtectionPolicy>,
}

impl ProcessInventory {
    pub fn new(policy: Arc<ProtectionPolicy>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_users_list();
        system.refresh_processes();
        Self {
            system: Mutex::new(system),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        // a panic mid-refresh leaves System usable; just take it back
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All processes, largest working set first. Processes that vanish
    /// mid-enumeration are skipped.
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.list_sorted(SortKey::Memory, true)
    }

    pub fn list_sorted(&self, key: SortKey, descending: bool) -> Vec<ProcessRecord> {
        let sched = platform::sched_info();
        let mut system = self.lock();
        system.refresh_cpu();
        system.refresh_users_list();
        system.refresh_processes();

        let cpus = system.cpus().len().max(1) as f64;
        let mut records: Vec<ProcessRecord> = system
            .processes()
            .values()
            .filter_map(|p| self.record_from(&system, p, cpus, &sched))
            .collect();
        drop(system);

        sort_records(&mut records, key, descending);
        records
    }

    pub fn get(&self, pid: u32) -> Result<ProcessRecord, ControlError> {
        let sched = platform::sched_info();
        let mut system = self.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_cpu();
        if !system.refresh_process(sys_pid) {
            return Err(ControlError::NotFound(format!("process {pid}")));
        }
        let cpus = system.cpus().len().max(1) as f64;
        system
            .process(sys_pid)
            .and_then(|p| self.record_from(&system, p, cpus, &sched))
            .ok_or_else(|| ControlError::NotFound(format!("process {pid}")))
    }

    /// Looks up a process and checks it is still the same one by start time.
    pub fn resolve(&self, identity: ProcessIdentity) -> Result<ProcessRecord, ControlError> {
        let record = self.get(identity.pid)?;
        if record.start_time != identity.start_time {
            return Err(ControlError::NotFound(format!(
                "process {} started at {}",
                identity.pid, identity.start_time
            )));
        }
        Ok(record)
    }

    pub fn search(&self, term: &str) -> Vec<ProcessRecord> {
        filter_by_name(self.list(), term)
    }

    fn record_from(
        &self,
        system: &System,
        process: &Process,
        cpus: f64,
        sched: &HashMap<u32, platform::SchedInfo>,
    ) -> Option<ProcessRecord> {
        let name = process.name().to_string();
        if name.is_empty() {
            return None;
        }
        let pid = process.pid().as_u32();
        let exe = process.exe();
        let exe_path = if exe.as_os_str().is_empty() {
            None
        } else {
            Some(exe.to_string_lossy().to_string())
        };
        let user = process
            .user_id()
            .and_then(|uid| system.users().iter().find(|u| u.id() == uid))
            .map(|u| u.name().to_string());
        let info = sched.get(&pid).copied().unwrap_or_default();

        Some(ProcessRecord {
            pid,
            parent_pid: process.parent().map(|p| p.as_u32()),
            is_system_process: self.policy.is_protected(&name),
            name,
            exe_path,
            user,
            command_line: process.cmd().join(" "),
            cpu_percent: super::clamp_percent(process.cpu_usage() as f64 / cpus),
            memory_bytes: process.memory(),
            thread_count: info.threads,
            start_time: process.start_time(),
            priority: info.priority,
            state: process.status().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, name: &str, cpu: f64, mem: u64) -> ProcessRecord {
        ProcessRecord {
            pid,
            parent_pid: None,
            name: name.to_string(),
            exe_path: None,
            user: None,
            command_line: String::new(),
            cpu_percent: cpu,
            memory_bytes: mem,
            thread_count: 1,
            start_time: 100,
            priority: Some(PriorityClass::Normal),
            state: ProcessState::Running,
            is_system_process: false,
        }
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let records = vec![
            record(1, "Chrome", 0.0, 1),
            record(2, "chromedriver", 0.0, 1),
            record(3, "bash", 0.0, 1),
        ];
        let found = filter_by_name(records.clone(), "CHROME");
        assert_eq!(found.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![1, 2]);
        assert!(filter_by_name(records.clone(), "zzz").is_empty());
        assert_eq!(filter_by_name(records, "  ").len(), 3);
    }

    #[test]
    fn sorts_by_each_key() {
        let mut records = vec![
            record(3, "beta", 5.0, 300),
            record(1, "Alpha", 50.0, 100),
            record(2, "gamma", 1.0, 200),
        ];
        sort_records(&mut records, SortKey::Memory, true);
        assert_eq!(records.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![3, 2, 1]);
        sort_records(&mut records, SortKey::Cpu, true);
        assert_eq!(records[0].pid, 1);
        sort_records(&mut records, SortKey::Name, false);
        assert_eq!(records[0].name, "Alpha");
        sort_records(&mut records, SortKey::Pid, false);
        assert_eq!(records.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn priority_class_parsing_and_nice_mapping() {
        assert_eq!("AboveNormal".parse::<PriorityClass>(), Ok(PriorityClass::AboveNormal));
        assert_eq!("below-normal".parse::<PriorityClass>(), Ok(PriorityClass::BelowNormal));
        assert_eq!("realtime".parse::<PriorityClass>(), Ok(PriorityClass::RealTime));
        assert!("turbo".parse::<PriorityClass>().is_err());
        for class in PriorityClass::ALL {
            assert_eq!(PriorityClass::from_nice(class.nice()), class);
        }
        assert_eq!(PriorityClass::from_base_priority(8), PriorityClass::Normal);
        assert_eq!(PriorityClass::from_base_priority(13), PriorityClass::High);
    }

    #[test]
    fn lists_current_process() {
        let inventory = ProcessInventory::new(Arc::new(ProtectionPolicy::default()));
        let me = std::process::id();
        let records = inventory.list();
        assert!(records.iter().any(|r| r.pid == me));
        assert!(records
            .windows(2)
            .all(|w| w[0].memory_bytes >= w[1].memory_bytes));

        let own = inventory.get(me).unwrap();
        assert!(own.cpu_percent >= 0.0 && own.cpu_percent <= 100.0);
        assert!(inventory.resolve(own.identity()).is_ok());
    }

    #[test]
    fn stale_identity_is_not_found() {
        let inventory = ProcessInventory::new(Arc::new(ProtectionPolicy::default()));
        let own = inventory.get(std::process::id()).unwrap();
        let stale = ProcessIdentity {
            pid: own.pid,
            start_time: own.start_time + 1,
        };
        assert!(matches!(inventory.resolve(stale), Err(ControlError::NotFound(_))));
    }

    #[test]
    fn missing_pid_is_not_found() {
        let inventory = ProcessInventory::new(Arc::new(ProtectionPolicy::default()));
        assert!(matches!(
            inventory.get(u32::MAX - 7),
            Err(ControlError::NotFound(_))
        ));
    }
}
