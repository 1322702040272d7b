//! Invocation status derived from the process table and marker files

use std::fmt;
use std::path::{Path, PathBuf};

use crate::Result;

/// Classification of one invocation. Never stored; always recomputed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Not a pid this executor could have produced
    #[default]
    Unknown,
    /// The process is still alive
    Running,
    /// The process is gone and left no failure marker
    Success,
    /// The process is gone and left a failure marker
    Failure,
}

impl ExecutionStatus {
    /// Success and Failure are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failure => "Failure",
        };
        f.write_str(s)
    }
}

/// Log file for an invocation
pub fn log_file(log_dir: &Path, pid: u32) -> PathBuf {
    log_dir.join(format!("{}.log", pid))
}

/// Failure marker for an invocation; only exists if the process failed
pub fn failure_marker(log_dir: &Path, pid: u32) -> PathBuf {
    log_dir.join(format!("{}.fail", pid))
}

/// Check if a process with the given PID is alive.
pub fn pid_alive(pid: u32) -> bool {
    // pid 0 and values past pid_t would address process groups, not a process
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // kill(pid, 0) checks if the process exists without sending a signal
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Derive the status of `pid`.
///
/// A pid that is neither alive nor marked failed reports `Success`. That
/// includes pids this executor never started; callers that need certainty
/// should wait on the invocation's completion signal instead.
pub fn status(log_dir: &Path, pid: u32) -> Result<ExecutionStatus> {
    if pid == 0 {
        return Ok(ExecutionStatus::Unknown);
    }
    if pid_alive(pid) {
        return Ok(ExecutionStatus::Running);
    }
    if failure_marker(log_dir, pid).try_exists()? {
        return Ok(ExecutionStatus::Failure);
    }
    Ok(ExecutionStatus::Success)
}
