use crate::collectors::processes::{PriorityClass, ProcessIdentity};
use crate::control::policy::ProtectionPolicy;
use crate::control::{report, run_blocking, ControlError};
use crate::metrics::Metrics;
use crate::platform;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTarget {
    pub pid: u32,
    pub name: String,
    pub start_time: u64,
    pub parent_pid: Option<u32>,
}

/// OS seam for process control. All methods block.
pub trait ProcessOs: Send + Sync {
    fn lookup(&self, pid: u32) -> Option<ProcessTarget>;
    fn all(&self) -> Vec<ProcessTarget>;
    fn terminate(&self, pid: u32) -> Result<(), ControlError>;
    fn suspend(&self, pid: u32) -> Result<(), ControlError>;
    fn resume(&self, pid: u32) -> Result<(), ControlError>;
    fn set_priority(&self, pid: u32, class: PriorityClass) -> Result<(), ControlError>;
}

/// Host implementation: sysinfo for lookups, platform calls for actions.
pub struct HostProcessOs {
    system: Mutex<System>,
}

impl HostProcessOs {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for HostProcessOs {
    fn default() -> Self {
        Self::new()
    }
}

fn target_of(process: &sysinfo::Process) -> ProcessTarget {
    ProcessTarget {
        pid: process.pid().as_u32(),
        name: process.name().to_string(),
        start_time: process.start_time(),
        parent_pid: process.parent().map(|p| p.as_u32()),
    }
}

impl ProcessOs for HostProcessOs {
    fn lookup(&self, pid: u32) -> Option<ProcessTarget> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let sys_pid = Pid::from_u32(pid);
        if !system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new()) {
            return None;
        }
        system.process(sys_pid).map(target_of)
    }

    fn all(&self) -> Vec<ProcessTarget> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_processes_specifics(ProcessRefreshKind::new());
        system.processes().values().map(target_of).collect()
    }

    fn terminate(&self, pid: u32) -> Result<(), ControlError> {
        platform::terminate(pid)
    }

    fn suspend(&self, pid: u32) -> Result<(), ControlError> {
        platform::suspend(pid)
    }

    fn resume(&self, pid: u32) -> Result<(), ControlError> {
        platform::resume(pid)
    }

    fn set_priority(&self, pid: u32, class: PriorityClass) -> Result<(), ControlError> {
        platform::set_priority(pid, class)
    }
}

/// Descendants of `root` in breadth-first order, root excluded.
fn descendants(root: u32, table: &[ProcessTarget]) -> Vec<&ProcessTarget> {
    let mut children: HashMap<u32, Vec<&ProcessTarget>> = HashMap::new();
    for t in table {
        if let Some(parent) = t.parent_pid {
            if parent != t.pid {
                children.entry(parent).or_default().push(t);
            }
        }
    }

    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    let mut seen = HashSet::from([root]);
    while let Some(pid) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child.pid) {
                out.push(*child);
                queue.push_back(child.pid);
            }
        }
    }
    out
}

/// Kill, suspend, resume and reprioritise processes. Every destructive
/// action is checked against the protection policy before the OS is touched.
#[derive(Clone)]
pub struct ProcessController {
    os: Arc<dyn ProcessOs>,
    policy: Arc<ProtectionPolicy>,
    metrics: Option<Arc<Metrics>>,
}

impl ProcessController {
    pub fn new(os: Arc<dyn ProcessOs>, policy: Arc<ProtectionPolicy>) -> Self {
        Self {
            os,
            policy,
            metrics: None,
        }
    }

    pub fn host(policy: Arc<ProtectionPolicy>) -> Self {
        Self::new(Arc::new(HostProcessOs::new()), policy)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn kill(&self, pid: u32, whole_tree: bool) -> Result<(), ControlError> {
        let this = self.clone();
        let result = run_blocking(move || this.kill_blocking(pid, whole_tree, None)).await;
        let op = if whole_tree { "kill_tree" } else { "kill" };
        report(self.metrics.as_deref(), op, &format!("pid {pid}"), &result);
        result
    }

    pub async fn kill_tree(&self, pid: u32) -> Result<(), ControlError> {
        self.kill(pid, true).await
    }

    /// Like `kill`, but fails with `NotFound` if the PID now belongs to a
    /// process with a different start time.
    pub async fn kill_verified(
        &self,
        identity: ProcessIdentity,
        whole_tree: bool,
    ) -> Result<(), ControlError> {
        let this = self.clone();
        let result = run_blocking(move || {
            this.kill_blocking(identity.pid, whole_tree, Some(identity.start_time))
        })
        .await;
        report(
            self.metrics.as_deref(),
            "kill_verified",
            &format!("pid {}", identity.pid),
            &result,
        );
        result
    }

    /// Suspends all threads of the process. Suspending a suspended process
    /// succeeds without stacking.
    pub async fn suspend(&self, pid: u32) -> Result<(), ControlError> {
        let this = self.clone();
        let result = run_blocking(move || {
            this.guarded_target(pid, None)?;
            this.os.suspend(pid)
        })
        .await;
        report(self.metrics.as_deref(), "suspend", &format!("pid {pid}"), &result);
        result
    }

    pub async fn resume(&self, pid: u32) -> Result<(), ControlError> {
        let this = self.clone();
        let result = run_blocking(move || {
            this.os
                .lookup(pid)
                .ok_or_else(|| ControlError::NotFound(format!("process {pid}")))?;
            this.os.resume(pid)
        })
        .await;
        report(self.metrics.as_deref(), "resume", &format!("pid {pid}"), &result);
        result
    }

    pub async fn set_priority(&self, pid: u32, class: PriorityClass) -> Result<(), ControlError> {
        let this = self.clone();
        let result = run_blocking(move || {
            this.guarded_target(pid, None)?;
            this.os.set_priority(pid, class)
        })
        .await;
        report(
            self.metrics.as_deref(),
            "set_priority",
            &format!("pid {pid} -> {class}"),
            &result,
        );
        result
    }

    fn guarded_target(
        &self,
        pid: u32,
        start_time: Option<u64>,
    ) -> Result<ProcessTarget, ControlError> {
        let target = self
            .os
            .lookup(pid)
            .ok_or_else(|| ControlError::NotFound(format!("process {pid}")))?;
        if let Some(expected) = start_time {
            if target.start_time != expected {
                return Err(ControlError::NotFound(format!(
                    "process {pid} started at {expected}"
                )));
            }
        }
        self.check_protected(&target)?;
        Ok(target)
    }

    fn check_protected(&self, target: &ProcessTarget) -> Result<(), ControlError> {
        if self.policy.is_protected(&target.name) {
            return Err(ControlError::ProtectedTarget(format!(
                "{} (pid {})",
                target.name, target.pid
            )));
        }
        Ok(())
    }

    fn kill_blocking(
        &self,
        pid: u32,
        whole_tree: bool,
        start_time: Option<u64>,
    ) -> Result<(), ControlError> {
        self.guarded_target(pid, start_time)?;
        if !whole_tree {
            return self.os.terminate(pid);
        }

        let table = self.os.all();
        let members = descendants(pid, &table);
        // refuse the whole tree if any member is protected
        for member in &members {
            self.check_protected(member)?;
        }

        self.os.terminate(pid)?;
        let mut first_error = None;
        for member in members {
            match self.os.terminate(member.pid) {
                Ok(()) => {}
                // exited on its own once the parent went away
                Err(ControlError::NotFound(_)) => {
                    debug!(pid = member.pid, "tree member already gone");
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeOs {
        table: Mutex<Vec<ProcessTarget>>,
        calls: Mutex<Vec<String>>,
        deny: Option<ControlError>,
    }

    impl FakeOs {
        fn with(targets: &[(u32, &str, Option<u32>)]) -> Self {
            let table = targets
                .iter()
                .map(|(pid, name, parent)| ProcessTarget {
                    pid: *pid,
                    name: name.to_string(),
                    start_time: 1_000 + *pid as u64,
                    parent_pid: *parent,
                })
                .collect();
            Self {
                table: Mutex::new(table),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn act(&self, what: &str, pid: u32) -> Result<(), ControlError> {
            if let Some(err) = &self.deny {
                return Err(err.clone());
            }
            self.calls.lock().unwrap().push(format!("{what} {pid}"));
            Ok(())
        }
    }

    impl ProcessOs for FakeOs {
        fn lookup(&self, pid: u32) -> Option<ProcessTarget> {
            self.table.lock().unwrap().iter().find(|t| t.pid == pid).cloned()
        }

        fn all(&self) -> Vec<ProcessTarget> {
            self.table.lock().unwrap().clone()
        }

        fn terminate(&self, pid: u32) -> Result<(), ControlError> {
            self.act("terminate", pid)?;
            self.table.lock().unwrap().retain(|t| t.pid != pid);
            Ok(())
        }

        fn suspend(&self, pid: u32) -> Result<(), ControlError> {
            self.act("suspend", pid)
        }

        fn resume(&self, pid: u32) -> Result<(), ControlError> {
            self.act("resume", pid)
        }

        fn set_priority(&self, pid: u32, class: PriorityClass) -> Result<(), ControlError> {
            self.act(&format!("priority({class})"), pid)
        }
    }

    fn controller(os: Arc<FakeOs>) -> ProcessController {
        ProcessController::new(os, Arc::new(ProtectionPolicy::default()))
    }

    #[tokio::test]
    async fn protected_process_is_never_touched() {
        let os = Arc::new(FakeOs::with(&[(4, "csrss.exe", None)]));
        let ctl = controller(os.clone());

        for result in [
            ctl.kill(4, false).await,
            ctl.kill(4, true).await,
            ctl.suspend(4).await,
            ctl.set_priority(4, PriorityClass::Idle).await,
        ] {
            assert!(matches!(result, Err(ControlError::ProtectedTarget(_))));
        }
        assert!(os.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_pid_is_not_found() {
        let os = Arc::new(FakeOs::with(&[(10, "notepad.exe", None)]));
        let ctl = controller(os.clone());
        assert!(matches!(ctl.kill(99, false).await, Err(ControlError::NotFound(_))));
        assert!(matches!(ctl.resume(99).await, Err(ControlError::NotFound(_))));
        assert!(os.calls().is_empty());
    }

    #[tokio::test]
    async fn kills_single_process() {
        let os = Arc::new(FakeOs::with(&[(10, "notepad.exe", None), (11, "child", Some(10))]));
        let ctl = controller(os.clone());
        ctl.kill(10, false).await.unwrap();
        assert_eq!(os.calls(), vec!["terminate 10"]);
        assert!(os.lookup(11).is_some());
    }

    #[tokio::test]
    async fn kill_tree_takes_all_descendants() {
        let os = Arc::new(FakeOs::with(&[
            (10, "shell", Some(1)),
            (11, "worker", Some(10)),
            (12, "worker", Some(10)),
            (13, "grandchild", Some(11)),
            (20, "unrelated", Some(1)),
        ]));
        let ctl = controller(os.clone());
        ctl.kill_tree(10).await.unwrap();
        assert_eq!(
            os.calls(),
            vec!["terminate 10", "terminate 11", "terminate 12", "terminate 13"]
        );
        assert!(os.lookup(20).is_some());
    }

    #[tokio::test]
    async fn kill_tree_refuses_protected_descendant() {
        let os = Arc::new(FakeOs::with(&[(10, "launcher", None), (11, "svchost.exe", Some(10))]));
        let ctl = controller(os.clone());
        assert!(matches!(
            ctl.kill_tree(10).await,
            Err(ControlError::ProtectedTarget(_))
        ));
        assert!(os.calls().is_empty());
    }

    #[tokio::test]
    async fn verified_kill_rejects_recycled_pid() {
        let os = Arc::new(FakeOs::with(&[(10, "notepad.exe", None)]));
        let ctl = controller(os.clone());
        let stale = ProcessIdentity {
            pid: 10,
            start_time: 1,
        };
        assert!(matches!(
            ctl.kill_verified(stale, false).await,
            Err(ControlError::NotFound(_))
        ));
        let current = ProcessIdentity {
            pid: 10,
            start_time: 1_010,
        };
        ctl.kill_verified(current, false).await.unwrap();
        assert_eq!(os.calls(), vec!["terminate 10"]);
    }

    #[tokio::test]
    async fn repeated_suspend_and_resume_succeed() {
        let os = Arc::new(FakeOs::with(&[(10, "notepad.exe", None)]));
        let ctl = controller(os.clone());
        ctl.suspend(10).await.unwrap();
        ctl.suspend(10).await.unwrap();
        ctl.resume(10).await.unwrap();
        ctl.set_priority(10, PriorityClass::High).await.unwrap();
        assert_eq!(
            os.calls(),
            vec!["suspend 10", "suspend 10", "resume 10", "priority(high) 10"]
        );
    }

    #[tokio::test]
    async fn os_errors_are_propagated() {
        let mut fake = FakeOs::with(&[(10, "notepad.exe", None)]);
        fake.deny = Some(ControlError::AccessDenied("process 10".to_string()));
        let ctl = controller(Arc::new(fake));
        assert!(matches!(
            ctl.set_priority(10, PriorityClass::RealTime).await,
            Err(ControlError::AccessDenied(_))
        ));
    }

    #[test]
    fn descendants_ignore_cycles() {
        let table = vec![
            ProcessTarget { pid: 1, name: "a".into(), start_time: 0, parent_pid: Some(2) },
            ProcessTarget { pid: 2, name: "b".into(), start_time: 0, parent_pid: Some(1) },
        ];
        let found: Vec<u32> = descendants(1, &table).iter().map(|t| t.pid).collect();
        assert_eq!(found, vec![2]);
    }
}
