use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, instrument, warn};

/// Parent pid → child pids, captured at one instant. Never cached.
#[derive(Debug, Default, Clone)]
pub struct ProcessTree {
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTree {
    /// Lists every process on the machine and indexes it by parent.
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes();
        let tree = Self::from_parent_pairs(system.processes().iter().filter_map(
            |(pid, process)| process.parent().map(|parent| (parent.as_u32(), pid.as_u32())),
        ));
        debug!(processes = system.processes().len(), "Captured process tree snapshot");
        tree
    }

    pub fn from_parent_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (parent, child) in pairs {
            if parent != child {
                children.entry(parent).or_default().push(child);
            }
        }
        Self { children }
    }

    pub fn children_of(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive descendants of `root`, breadth first, `root` excluded.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        let mut found = Vec::new();
        while let Some(pid) = queue.pop_front() {
            for &child in self.children_of(pid) {
                if seen.insert(child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        found
    }
}

/// Delivers signals to OS processes.
pub trait ProcessSignaller: Send + Sync {
    /// Polite interrupt (SIGINT on unix).
    fn interrupt(&self, pid: u32) -> io::Result<()>;

    /// Immediate, uncatchable kill.
    fn force_kill(&self, pid: u32) -> io::Result<()>;

    /// Kills every member of the process group led by `pgid`.
    fn force_kill_group(&self, _pgid: u32) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignaller;

#[cfg(unix)]
impl ProcessSignaller for OsSignaller {
    fn interrupt(&self, pid: u32) -> io::Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGINT)
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn force_kill_group(&self, pgid: u32) -> io::Result<()> {
        let pgid = raw_pid(pgid)?;
        nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL).map_err(io::Error::from)
    }
}

#[cfg(unix)]
fn raw_pid(pid: u32) -> io::Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {}", pid)))
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    nix::sys::signal::kill(raw_pid(pid)?, signal).map_err(io::Error::from)
}

#[cfg(not(unix))]
impl ProcessSignaller for OsSignaller {
    fn interrupt(&self, pid: u32) -> io::Result<()> {
        // No console interrupt for a detached child here; terminate instead.
        self.force_kill(pid)
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        let target = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_process(target);
        match system.process(target) {
            Some(process) if process.kill() => Ok(()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("failed to kill process {}", pid),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("process {} not found", pid),
            )),
        }
    }
}

/// Outcome of one tree termination. Failures are informational only.
#[derive(Debug, Default, Clone, Serialize)]
pub struct KillReport {
    pub root: u32,
    pub killed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

/// Force-kills the descendants of a process, one best-effort attempt per pid.
#[derive(Clone)]
pub struct ProcessTreeTerminator {
    signaller: Arc<dyn ProcessSignaller>,
}

impl Default for ProcessTreeTerminator {
    fn default() -> Self {
        Self::new(Arc::new(OsSignaller))
    }
}

impl std::fmt::Debug for ProcessTreeTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTreeTerminator").finish_non_exhaustive()
    }
}

impl ProcessTreeTerminator {
    pub fn new(signaller: Arc<dyn ProcessSignaller>) -> Self {
        Self { signaller }
    }

    pub fn interrupt(&self, pid: u32) -> io::Result<()> {
        self.signaller.interrupt(pid)
    }

    /// Snapshots the live process table, kills every descendant of `root`, then
    /// sweeps `root`'s process group for children that were already reparented.
    #[instrument(skip(self))]
    pub fn terminate_descendants(&self, root: u32) -> KillReport {
        let tree = ProcessTree::snapshot();
        let report = self.kill_descendants(root, &tree);
        if let Err(e) = self.signaller.force_kill_group(root) {
            debug!(pgid = root, error = %e, "Process group sweep found nothing to kill");
        }
        if !report.failed.is_empty() {
            warn!(root, failed = report.failed.len(), killed = report.killed.len(), "Some descendants could not be killed");
        }
        report
    }

    /// Kills the descendants recorded in `tree`; whether `root` still exists is irrelevant.
    pub fn kill_descendants(&self, root: u32, tree: &ProcessTree) -> KillReport {
        let mut report = KillReport {
            root,
            ..Default::default()
        };
        for pid in tree.descendants(root) {
            match self.signaller.force_kill(pid) {
                Ok(()) => {
                    debug!(pid, root, "Sent SIGKILL to descendant");
                    report.killed.push(pid);
                }
                Err(e) => {
                    debug!(pid, root, error = %e, "Failed to kill descendant");
                    report.failed.push((pid, e.to_string()));
                }
            }
        }
        report
    }
}
