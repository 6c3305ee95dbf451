//! Process tree termination.
//!
//! An agent process may fork helpers of its own. Terminating only the direct
//! child leaves those orphaned, so teardown walks the whole tree: descendants
//! first (leaves before their parents), then the root, then after a grace
//! period anything still alive gets `SIGKILL`.
//!
//! All operations here are blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use thiserror::Error;

/// Errors raised while walking or signalling a process tree.
#[derive(Debug, Error)]
pub enum ProcessTreeError {
    #[error("Refusing to signal protected pid {0}")]
    Protected(u32),
    #[error("Pid {0} does not fit the platform pid type")]
    InvalidPid(u32),
    #[error("Failed to enumerate processes: {0}")]
    Enumerate(#[from] std::io::Error),
    #[error("Failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: Errno },
}

/// OS operations needed to tear down a process tree.
pub trait ProcessTree: Send + Sync {
    /// All descendants of `pid`, ordered leaves first.
    ///
    /// # Errors
    /// Returns error if the process table cannot be read.
    fn list_descendants(&self, pid: u32) -> Result<Vec<u32>, ProcessTreeError>;

    /// Ask a process to exit. `Ok(false)` when it was already gone.
    ///
    /// # Errors
    /// Returns error if the signal could not be delivered.
    fn terminate(&self, pid: u32) -> Result<bool, ProcessTreeError>;

    /// Kill a process outright. `Ok(false)` when it was already gone.
    ///
    /// # Errors
    /// Returns error if the signal could not be delivered.
    fn force_kill(&self, pid: u32) -> Result<bool, ProcessTreeError>;

    /// Signal every member of the process group led by `pgid`.
    ///
    /// # Errors
    /// Returns error if the signal could not be delivered.
    fn signal_group(&self, pgid: u32, force: bool) -> Result<bool, ProcessTreeError>;

    /// Whether `pid` is still running. Zombies count as exited.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Tunables for [`kill_tree`].
#[derive(Debug, Clone)]
pub struct KillTreeConfig {
    pub grace_period: Duration,
    pub poll_interval: Duration,
    /// Also signal the process group led by the root.
    pub include_group: bool,
}

impl Default for KillTreeConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            include_group: true,
        }
    }
}

/// What a [`kill_tree`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    pub terminated: Vec<u32>,
    pub force_killed: Vec<u32>,
}

impl KillReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.force_killed.is_empty()
    }
}

/// Terminate `root` and all of its descendants.
///
/// A root that has already exited is a no-op apart from sweeping its process
/// group, which catches helpers that outlived it.
///
/// # Errors
/// Returns error for protected pids or if the process table cannot be read.
pub fn kill_tree(
    tree: &dyn ProcessTree,
    root: u32,
    config: &KillTreeConfig,
) -> Result<KillReport, ProcessTreeError> {
    if root <= 1 {
        return Err(ProcessTreeError::Protected(root));
    }

    let mut report = KillReport::default();

    if !tree.is_alive(root) {
        if config.include_group {
            let _ = tree.signal_group(root, true)?;
        }
        return Ok(report);
    }

    let mut targets = tree.list_descendants(root)?;
    targets.push(root);

    for &pid in &targets {
        match tree.terminate(pid) {
            Ok(true) => report.terminated.push(pid),
            Ok(false) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to terminate process"),
        }
    }
    if config.include_group {
        let _ = tree.signal_group(root, false)?;
    }

    let deadline = Instant::now() + config.grace_period;
    let mut survivors: Vec<u32> = targets.clone();
    loop {
        survivors.retain(|&pid| tree.is_alive(pid));
        if survivors.is_empty() || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(config.poll_interval);
    }

    for pid in survivors {
        tracing::debug!(pid, "process survived grace period, killing");
        match tree.force_kill(pid) {
            Ok(true) => report.force_killed.push(pid),
            Ok(false) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to kill process"),
        }
    }
    if config.include_group {
        let _ = tree.signal_group(root, true)?;
    }

    Ok(report)
}

/// [`ProcessTree`] backed by the host OS.
///
/// Uses `/proc` on Linux and `ps` elsewhere for enumeration.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessTree;

impl UnixProcessTree {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn send(pid: u32, sig: Signal) -> Result<bool, ProcessTreeError> {
        if pid <= 1 {
            return Err(ProcessTreeError::Protected(pid));
        }
        let raw = i32::try_from(pid).map_err(|_| ProcessTreeError::InvalidPid(pid))?;
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => {
                tracing::warn!(pid, "not permitted to signal process");
                Ok(false)
            }
            Err(source) => Err(ProcessTreeError::Signal { pid, source }),
        }
    }

    /// `(pid, ppid)` for every live process.
    #[cfg(target_os = "linux")]
    fn process_table() -> Result<Vec<(u32, u32)>, ProcessTreeError> {
        let mut table = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes can vanish between readdir and read.
            let Ok(status) = std::fs::read_to_string(entry.path().join("status")) else {
                continue;
            };
            if let Some(ppid) = status_field(&status, "PPid:").and_then(|v| v.parse().ok()) {
                table.push((pid, ppid));
            }
        }
        Ok(table)
    }

    #[cfg(not(target_os = "linux"))]
    fn process_table() -> Result<Vec<(u32, u32)>, ProcessTreeError> {
        let output = std::process::Command::new("ps")
            .args(["-axo", "pid=,ppid="])
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut cols = line.split_whitespace();
                let pid = cols.next()?.parse().ok()?;
                let ppid = cols.next()?.parse().ok()?;
                Some((pid, ppid))
            })
            .collect())
    }
}

#[cfg(target_os = "linux")]
fn status_field<'a>(status: &'a str, key: &str) -> Option<&'a str> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .map(str::trim)
}

/// Descendants of `root` from a `(pid, ppid)` table, deepest first.
fn descendants_leaves_first(table: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in table {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                order.push(child);
                queue.push_back(child);
            }
        }
    }
    order.reverse();
    order
}

impl ProcessTree for UnixProcessTree {
    fn list_descendants(&self, pid: u32) -> Result<Vec<u32>, ProcessTreeError> {
        Ok(descendants_leaves_first(&Self::process_table()?, pid))
    }

    fn terminate(&self, pid: u32) -> Result<bool, ProcessTreeError> {
        Self::send(pid, Signal::SIGTERM)
    }

    fn force_kill(&self, pid: u32) -> Result<bool, ProcessTreeError> {
        Self::send(pid, Signal::SIGKILL)
    }

    fn signal_group(&self, pgid: u32, force: bool) -> Result<bool, ProcessTreeError> {
        if pgid <= 1 {
            return Err(ProcessTreeError::Protected(pgid));
        }
        let raw = i32::try_from(pgid).map_err(|_| ProcessTreeError::InvalidPid(pgid))?;
        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match signal::killpg(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH | Errno::EPERM) => Ok(false),
            Err(source) => Err(ProcessTreeError::Signal { pid: pgid, source }),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string(format!("/proc/{pid}/status")).is_ok_and(|status| {
                !status_field(&status, "State:").is_some_and(|s| s.starts_with('Z') || s.starts_with('X'))
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let Ok(raw) = i32::try_from(pid) else {
                return false;
            };
            !matches!(signal::kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
        }
    }
}
