use super::SchedInfo;
use crate::collectors::processes::PriorityClass;
use crate::control::ControlError;
use std::collections::HashMap;
use std::mem;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, Thread32First, Thread32Next,
    PROCESSENTRY32W, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows_sys::Win32::System::Threading::{
    OpenProcess, OpenThread, ResumeThread, SetPriorityClass, SuspendThread, TerminateProcess,
    ABOVE_NORMAL_PRIORITY_CLASS, BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS,
    IDLE_PRIORITY_CLASS, NORMAL_PRIORITY_CLASS, PROCESS_SET_INFORMATION, PROCESS_TERMINATE,
    REALTIME_PRIORITY_CLASS, THREAD_SUSPEND_RESUME,
};

struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn open(raw: HANDLE) -> Option<Self> {
        if raw.is_null() || raw == INVALID_HANDLE_VALUE {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a successful open call and is
        // closed exactly once.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn last_error(pid: u32) -> ControlError {
    // SAFETY: reads thread-local error state only.
    let code = unsafe { GetLastError() };
    match code {
        ERROR_ACCESS_DENIED => ControlError::AccessDenied(format!("process {pid}")),
        ERROR_INVALID_PARAMETER => ControlError::NotFound(format!("process {pid}")),
        other => ControlError::TransientOsFailure(format!("process {pid}: win32 error {other}")),
    }
}

fn open_process(pid: u32, access: u32) -> Result<OwnedHandle, ControlError> {
    // SAFETY: OpenProcess has no pointer arguments.
    let raw = unsafe { OpenProcess(access, 0, pid) };
    OwnedHandle::open(raw).ok_or_else(|| last_error(pid))
}

pub fn terminate(pid: u32) -> Result<(), ControlError> {
    let handle = open_process(pid, PROCESS_TERMINATE)?;
    // SAFETY: handle is valid and opened with PROCESS_TERMINATE.
    if unsafe { TerminateProcess(handle.0, 1) } == 0 {
        return Err(last_error(pid));
    }
    Ok(())
}

pub fn set_priority(pid: u32, class: PriorityClass) -> Result<(), ControlError> {
    let flag = match class {
        PriorityClass::Idle => IDLE_PRIORITY_CLASS,
        PriorityClass::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
        PriorityClass::Normal => NORMAL_PRIORITY_CLASS,
        PriorityClass::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
        PriorityClass::High => HIGH_PRIORITY_CLASS,
        PriorityClass::RealTime => REALTIME_PRIORITY_CLASS,
    };
    let handle = open_process(pid, PROCESS_SET_INFORMATION)?;
    // SAFETY: handle is valid and opened with PROCESS_SET_INFORMATION.
    if unsafe { SetPriorityClass(handle.0, flag) } == 0 {
        return Err(last_error(pid));
    }
    Ok(())
}

/// Suspends every thread of the process. Threads that were already suspended
/// are resumed once more so repeated calls never stack suspend counts.
pub fn suspend(pid: u32) -> Result<(), ControlError> {
    for_each_thread(pid, |thread| {
        // SAFETY: thread handle opened with THREAD_SUSPEND_RESUME.
        let previous = unsafe { SuspendThread(thread) };
        if previous != u32::MAX && previous > 0 {
            unsafe {
                ResumeThread(thread);
            }
        }
    })
}

/// Drops the suspend count of every thread to zero.
pub fn resume(pid: u32) -> Result<(), ControlError> {
    for_each_thread(pid, |thread| loop {
        // SAFETY: thread handle opened with THREAD_SUSPEND_RESUME.
        let previous = unsafe { ResumeThread(thread) };
        if previous == u32::MAX || previous <= 1 {
            break;
        }
    })
}

fn for_each_thread(pid: u32, mut op: impl FnMut(HANDLE)) -> Result<(), ControlError> {
    let thread_ids = threads_of(pid)?;
    if thread_ids.is_empty() {
        return Err(ControlError::NotFound(format!("process {pid}")));
    }

    let mut touched = 0usize;
    for tid in thread_ids {
        // SAFETY: OpenThread has no pointer arguments.
        let raw = unsafe { OpenThread(THREAD_SUSPEND_RESUME, 0, tid) };
        let Some(thread) = OwnedHandle::open(raw) else {
            continue;
        };
        op(thread.0);
        touched += 1;
    }

    if touched == 0 {
        return Err(ControlError::AccessDenied(format!("process {pid}")));
    }
    Ok(())
}

fn threads_of(pid: u32) -> Result<Vec<u32>, ControlError> {
    // SAFETY: snapshot handle is checked before use and closed by OwnedHandle.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    let snapshot = OwnedHandle::open(snapshot).ok_or_else(|| last_error(pid))?;

    let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;

    let mut out = Vec::new();
    // SAFETY: entry is a properly sized THREADENTRY32.
    let mut more = unsafe { Thread32First(snapshot.0, &mut entry) } != 0;
    while more {
        if entry.th32OwnerProcessID == pid {
            out.push(entry.th32ThreadID);
        }
        more = unsafe { Thread32Next(snapshot.0, &mut entry) } != 0;
    }
    Ok(out)
}

pub fn sched_info() -> HashMap<u32, SchedInfo> {
    let mut out = HashMap::new();
    // SAFETY: snapshot handle is checked before use and closed by OwnedHandle.
    let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    let Some(snapshot) = OwnedHandle::open(raw) else {
        return out;
    };

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as u32;

    // SAFETY: entry is a properly sized PROCESSENTRY32W.
    let mut more = unsafe { Process32FirstW(snapshot.0, &mut entry) } != 0;
    while more {
        out.insert(
            entry.th32ProcessID,
            SchedInfo {
                threads: entry.cntThreads,
                priority: Some(PriorityClass::from_base_priority(entry.pcPriClassBase)),
            },
        );
        more = unsafe { Process32NextW(snapshot.0, &mut entry) } != 0;
    }
    out
}
