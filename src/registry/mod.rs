//! Process-wide work registry
//!
//! Single shared map of active child processes. Every public operation
//! takes the registry's one exclusive lock for its whole duration; the two
//! exceptions are the death level (an atomic the signal handler bumps
//! without locking) and the per-record status word (an atomic so the
//! reaper path can flip a record to `Reaped` from any context).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use crate::error::{SmoothXError, SmoothXResult, StageKind};

pub type Pid = u32;

/// Death level raised by signal delivery; read by every supervisor.
///
/// Lives outside the locked map so the signal handler never touches the
/// mutex.
static DEATH_LEVEL: AtomicU32 = AtomicU32::new(0);

/// Lifecycle of one supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ChildStatus {
    Created = 0,
    Running = 1,
    Killed = 2,
    Finished = 3,
    Reaped = 4,
}

impl ChildStatus {
    fn from_u8(raw: u8) -> ChildStatus {
        match raw {
            0 => ChildStatus::Created,
            1 => ChildStatus::Running,
            2 => ChildStatus::Killed,
            3 => ChildStatus::Finished,
            _ => ChildStatus::Reaped,
        }
    }
}

/// Shared handle to one record's status word
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn get(&self) -> ChildStatus {
        ChildStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ChildStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Interpolation parameters carried by a worker record, enough to rebuild
/// its argv with the alternate filter family after a freeze
#[derive(Debug, Clone, Serialize)]
pub struct StageParams {
    pub stage: StageKind,
    pub decimate_max: u32,
    pub decimate_frac: f64,
    pub target_fps: u32,
    pub source_slot: usize,
    pub target_slot: usize,
    pub alt_algorithm: bool,
}

/// One supervised external command
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub pid: Pid,
    /// Owning source-group id; 0 for probes and capture runs
    pub gid: u32,
    /// Full re-launchable argv, program first
    pub argv: Vec<String>,
    pub stage_params: Option<StageParams>,
    pub progress_path: Option<PathBuf>,
    pub source_template: Option<String>,
    pub target_template: Option<String>,
    pub stdout_buf: Vec<String>,
    pub stderr_buf: Vec<String>,
    pub exit_code: i32,
    pub error_msg: String,
    pub status: StatusCell,
    pub restart_requested: bool,
}

impl ChildRecord {
    pub fn new(pid: Pid, gid: u32, argv: Vec<String>) -> Self {
        Self {
            pid,
            gid,
            argv,
            stage_params: None,
            progress_path: None,
            source_template: None,
            target_template: None,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            exit_code: 0,
            error_msg: String::new(),
            status: StatusCell::default(),
            restart_requested: false,
        }
    }
}

/// Which output channel a supervisor line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// The registry proper: pid → record behind one lock
pub struct WorkRegistry {
    inner: Mutex<HashMap<Pid, ChildRecord>>,
    /// Widest pid seen, for aligned child-table dumps
    max_pid_width: AtomicU32,
    lock_debug: bool,
}

impl WorkRegistry {
    pub fn new(lock_debug: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            max_pid_width: AtomicU32::new(1),
            lock_debug,
        })
    }

    fn lock(&self, op: &str) -> MutexGuard<'_, HashMap<Pid, ChildRecord>> {
        if self.lock_debug {
            debug!("registry lock: {}", op);
        }
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new child; a still-present pid is a hard error
    pub fn add(&self, record: ChildRecord) -> SmoothXResult<()> {
        let mut map = self.lock("add");
        if map.contains_key(&record.pid) {
            return Err(SmoothXError::Internal {
                message: format!("duplicate pid {} in registry", record.pid),
            });
        }
        let width = record.pid.to_string().len() as u32;
        self.max_pid_width.fetch_max(width, Ordering::Relaxed);
        map.insert(record.pid, record);
        Ok(())
    }

    /// Drop a record, optionally deleting its progress file
    ///
    /// Returns the removed record, or None when the pid is already gone
    /// (idempotent once reaped).
    pub fn remove(&self, pid: Pid, cleanup: bool) -> Option<ChildRecord> {
        let record = self.lock("remove").remove(&pid)?;
        if cleanup {
            if let Some(path) = &record.progress_path {
                let _ = std::fs::remove_file(path);
            }
        }
        Some(record)
    }

    pub fn set_status(&self, pid: Pid, status: ChildStatus) {
        if let Some(record) = self.lock("set_status").get(&pid) {
            record.status.set(status);
        }
    }

    pub fn get_status(&self, pid: Pid) -> Option<ChildStatus> {
        self.lock("get_status").get(&pid).map(|r| r.status.get())
    }

    /// Hand out the record's status cell so a supervisor can watch and
    /// update it without the map lock
    pub fn status_cell(&self, pid: Pid) -> Option<StatusCell> {
        self.lock("status_cell").get(&pid).map(|r| r.status.clone())
    }

    pub fn mark_restart(&self, pid: Pid) {
        if let Some(record) = self.lock("mark_restart").get_mut(&pid) {
            record.restart_requested = true;
        }
    }

    pub fn shall_restart(&self, pid: Pid) -> bool {
        self.lock("shall_restart")
            .get(&pid)
            .map(|r| r.restart_requested)
            .unwrap_or(false)
    }

    pub fn snapshot_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.lock("snapshot_pids").keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Records whose status has not reached `Reaped`
    pub fn active_count(&self) -> usize {
        self.lock("active_count")
            .values()
            .filter(|r| r.status.get() < ChildStatus::Reaped)
            .count()
    }

    /// Clone of a record for inspection outside the lock
    pub fn get(&self, pid: Pid) -> Option<ChildRecord> {
        self.lock("get").get(&pid).cloned()
    }

    /// Append one output line to a record's channel buffer
    pub fn append_line(&self, pid: Pid, channel: OutputChannel, line: String) {
        if let Some(record) = self.lock("append_line").get_mut(&pid) {
            match channel {
                OutputChannel::Stdout => record.stdout_buf.push(line),
                OutputChannel::Stderr => record.stderr_buf.push(line),
            }
        }
    }

    /// Store the decoded exit of a finished child
    pub fn set_exit(&self, pid: Pid, exit_code: i32, error_msg: String) {
        if let Some(record) = self.lock("set_exit").get_mut(&pid) {
            record.exit_code = exit_code;
            record.error_msg = error_msg;
        }
    }

    /// Raise the death level; it never goes back down
    pub fn raise_death(level: u32) {
        DEATH_LEVEL.fetch_max(level, Ordering::AcqRel);
    }

    /// Bump the death level by one, returning the new value (signal path)
    pub fn bump_death() -> u32 {
        DEATH_LEVEL.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn read_death() -> u32 {
        DEATH_LEVEL.load(Ordering::Acquire)
    }

    pub fn max_pid_width(&self) -> usize {
        self.max_pid_width.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: Pid, gid: u32) -> ChildRecord {
        ChildRecord::new(pid, gid, vec!["true".to_string()])
    }

    #[test]
    fn test_add_rejects_duplicate_pid() {
        let registry = WorkRegistry::new(false);
        registry.add(record(100, 1)).unwrap();
        let err = registry.add(record(100, 1)).unwrap_err();
        assert!(err.to_string().contains("duplicate pid"));
    }

    #[test]
    fn test_lifecycle_and_active_count() {
        let registry = WorkRegistry::new(false);
        registry.add(record(7, 1)).unwrap();
        registry.add(record(8, 1)).unwrap();
        assert_eq!(registry.active_count(), 2);

        registry.set_status(7, ChildStatus::Running);
        registry.set_status(7, ChildStatus::Finished);
        assert_eq!(registry.active_count(), 2);

        registry.set_status(7, ChildStatus::Reaped);
        assert_eq!(registry.active_count(), 1);

        // still readable after reaping, removable exactly once
        assert!(registry.get(7).is_some());
        assert!(registry.remove(7, false).is_some());
        assert!(registry.remove(7, false).is_none());
    }

    #[test]
    fn test_status_cell_bypasses_lock() {
        let registry = WorkRegistry::new(false);
        registry.add(record(21, 0)).unwrap();
        let cell = registry.status_cell(21).unwrap();
        cell.set(ChildStatus::Reaped);
        assert_eq!(registry.get_status(21), Some(ChildStatus::Reaped));
    }

    #[test]
    fn test_restart_flag() {
        let registry = WorkRegistry::new(false);
        registry.add(record(33, 2)).unwrap();
        assert!(!registry.shall_restart(33));
        registry.mark_restart(33);
        assert!(registry.shall_restart(33));
        assert!(!registry.shall_restart(99));
    }

    #[test]
    fn test_output_buffers() {
        let registry = WorkRegistry::new(false);
        registry.add(record(50, 1)).unwrap();
        registry.append_line(50, OutputChannel::Stdout, "out line".to_string());
        registry.append_line(50, OutputChannel::Stderr, "err line".to_string());
        registry.set_exit(50, 1, "Exited with error 1".to_string());

        let rec = registry.get(50).unwrap();
        assert_eq!(rec.stdout_buf, vec!["out line"]);
        assert_eq!(rec.stderr_buf, vec!["err line"]);
        assert_eq!(rec.exit_code, 1);
        assert_eq!(rec.error_msg, "Exited with error 1");
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = WorkRegistry::new(false);
        for pid in [42, 7, 19] {
            registry.add(record(pid, 1)).unwrap();
        }
        assert_eq!(registry.snapshot_pids(), vec![7, 19, 42]);
    }
}
