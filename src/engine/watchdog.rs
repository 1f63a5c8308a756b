//! Progress watchdog
//!
//! Ticks over the registry while a stage runs: tails every worker's
//! progress file, renders a one-line console indicator, escalates strikes
//! against frozen workers, restarts them with the alternate filter family,
//! and drains stragglers when the stage (or the whole run) winds down.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::filters;
use crate::engine::progress::{self, ProgressFrame, ProgressState};
use crate::engine::supervisor::{self, SpawnSpec};
use crate::error::{SmoothXError, SmoothXResult};
use crate::registry::{ChildRecord, ChildStatus, Pid, WorkRegistry};
use crate::utils::time::format_out_time;

/// Ticks without a `progress=continue` before a worker counts as frozen;
/// 240 half-second ticks ≈ 120 s
pub const TIMEOUT_INTERVALS: i32 = 240;
/// Watchdog tick
const TICK: Duration = Duration::from_millis(500);

const STRIKE_TERM: u32 = 1;
const STRIKE_KILL: u32 = 7;
const STRIKE_REAP: u32 = 13;
/// Strikes beyond this trigger the alt-algorithm restart
const STRIKE_RESTART_AFTER: u32 = 17;

/// Graduated TERM windows for the final drain, then the hard deadline
const DRAIN_TERM_WINDOWS_S: [u64; 5] = [3, 4, 5, 6, 7];
const DRAIN_KILL_DEADLINE: Duration = Duration::from_secs(10);

/// What a strike count demands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrikeAction {
    Term,
    Kill,
    Reap,
    Restart,
}

fn strike_action(count: u32) -> Option<StrikeAction> {
    match count {
        STRIKE_TERM => Some(StrikeAction::Term),
        STRIKE_KILL => Some(StrikeAction::Kill),
        STRIKE_REAP => Some(StrikeAction::Reap),
        c if c > STRIKE_RESTART_AFTER => Some(StrikeAction::Restart),
        _ => None,
    }
}

/// Per-pid escalation state, owned by the watchdog
struct Escalation {
    timeout_ticks: i32,
    strike_count: u32,
    last: ProgressFrame,
    /// Only workers with a progress file are subject to freeze detection
    expects_progress: bool,
    ended: bool,
}

/// Everything the orchestrator needs back from one stage
pub struct StageReport {
    /// Final record of every worker, replacements included
    pub outcomes: Vec<ChildRecord>,
    /// Aggregate drop+dup frames observed during the stage
    pub dropdups: u64,
}

/// The stage watchdog; create one per pipeline run
pub struct Watchdog {
    registry: Arc<WorkRegistry>,
    /// Delete progress files on record removal (off when retaining
    /// temporaries for debugging)
    cleanup_progress: bool,
    timeout_intervals: i32,
    tick: Duration,
    rendered_len: usize,
}

impl Watchdog {
    pub fn new(registry: Arc<WorkRegistry>, cleanup_progress: bool) -> Self {
        Self {
            registry,
            cleanup_progress,
            timeout_intervals: TIMEOUT_INTERVALS,
            tick: TICK,
            rendered_len: 0,
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, timeout_intervals: i32, tick: Duration) -> Self {
        self.timeout_intervals = timeout_intervals;
        self.tick = tick;
        self
    }

    /// Tick until every child of the current stage is gone
    ///
    /// Returns the final records (after removal from the registry) and the
    /// stage's dropdups aggregate. A raised death level turns into a
    /// bounded teardown and `Terminated`.
    pub fn await_stage(&mut self, label: &str) -> SmoothXResult<StageReport> {
        let mut escalation: HashMap<Pid, Escalation> = HashMap::new();
        let mut stage_dropdups: u64 = 0;

        loop {
            if WorkRegistry::read_death() >= 1 {
                self.clear_line();
                self.drain_all();
                self.collect(&mut escalation);
                return Err(SmoothXError::Terminated);
            }

            let pids = self.registry.snapshot_pids();
            let total = pids.len();
            let mut running = 0usize;
            let mut aggregate = ProgressFrame::default();

            for pid in &pids {
                let Some(record) = self.registry.get(*pid) else {
                    continue;
                };
                let status = record.status.get();
                if status <= ChildStatus::Running {
                    running += 1;
                }

                let entry = escalation.entry(*pid).or_insert_with(|| Escalation {
                    timeout_ticks: self.timeout_intervals,
                    strike_count: 0,
                    last: ProgressFrame::default(),
                    expects_progress: record.progress_path.is_some(),
                    ended: false,
                });

                if let Some(path) = &record.progress_path {
                    let frame = progress::read_latest(path);
                    match frame.state {
                        ProgressState::Continue => {
                            entry.timeout_ticks = self.timeout_intervals;
                            entry.last = frame;
                        }
                        ProgressState::Ended => {
                            entry.timeout_ticks = self.timeout_intervals;
                            entry.last = frame;
                            entry.ended = true;
                        }
                        ProgressState::None => {
                            if status == ChildStatus::Running && entry.expects_progress {
                                entry.timeout_ticks -= 1;
                            }
                        }
                    }
                }
                aggregate.absorb(&entry.last);
            }

            stage_dropdups = stage_dropdups.max(aggregate.dropdups());
            self.render(running, total, &aggregate);

            // strike escalation for frozen workers
            let frozen: Vec<Pid> = escalation
                .iter()
                .filter(|(pid, e)| {
                    e.timeout_ticks <= 0
                        && !e.ended
                        && (self.registry.get_status(**pid) == Some(ChildStatus::Running)
                            || self.registry.shall_restart(**pid))
                })
                .map(|(pid, _)| *pid)
                .collect();
            for pid in frozen {
                self.strike(pid, &mut escalation)?;
            }

            if running == 0 {
                break;
            }
            std::thread::sleep(self.tick);
        }

        self.finish_line(label, &escalation);
        self.drain_all();
        let outcomes = self.collect(&mut escalation);
        Ok(StageReport {
            outcomes,
            dropdups: stage_dropdups,
        })
    }

    fn strike(&mut self, pid: Pid, escalation: &mut HashMap<Pid, Escalation>) -> SmoothXResult<()> {
        let count = {
            let entry = escalation.get_mut(&pid).expect("striked pid has state");
            entry.strike_count += 1;
            entry.strike_count
        };

        match strike_action(count) {
            Some(StrikeAction::Term) => {
                warn!("worker {} frozen, strike {}: TERM", pid, count);
                supervisor::send_signal(pid, libc::SIGTERM);
                self.registry.mark_restart(pid);
            }
            Some(StrikeAction::Kill) => {
                warn!("worker {} still frozen, strike {}: KILL", pid, count);
                supervisor::send_signal(pid, libc::SIGKILL);
                self.registry.mark_restart(pid);
            }
            Some(StrikeAction::Reap) => {
                warn!("worker {} unresponsive, strike {}: reaping", pid, count);
                supervisor::reap(pid);
                self.registry.set_status(pid, ChildStatus::Reaped);
            }
            Some(StrikeAction::Restart) => {
                self.restart(pid)?;
                escalation.remove(&pid);
            }
            None => {}
        }
        Ok(())
    }

    /// Relaunch a frozen worker with the alternate filter family
    fn restart(&mut self, pid: Pid) -> SmoothXResult<()> {
        let Some(old) = self.registry.get(pid) else {
            return Ok(());
        };
        let Some(params) = &old.stage_params else {
            // nothing to vary for non-interpolation children; surface it
            return Err(SmoothXError::WorkerCrash {
                message: format!("worker {} froze and cannot be restarted", pid),
            });
        };

        let mut new_params = params.clone();
        new_params.alt_algorithm = true;

        let graph = filters::interp_graph(&new_params, false).render("0:v");
        let mut argv = old.argv.clone();
        let pos = argv
            .iter()
            .position(|a| a == "-filter_complex")
            .filter(|pos| pos + 1 < argv.len())
            .ok_or_else(|| SmoothXError::Internal {
                message: format!("worker {} argv lacks a filter graph", pid),
            })?;
        argv[pos + 1] = graph;

        if let Some(path) = &old.progress_path {
            let _ = std::fs::remove_file(path);
        }

        info!(
            "restarting worker {} (group {}, slot {}) with the fallback interpolator",
            pid, old.gid, new_params.target_slot
        );

        let spec = SpawnSpec {
            argv,
            gid: old.gid,
            stage_params: Some(new_params),
            progress_path: old.progress_path.clone(),
            source_template: old.source_template.clone(),
            target_template: old.target_template.clone(),
        };

        // the frozen record leaves without cleanup so the replacement
        // inherits its progress path
        self.registry.remove(pid, false);
        let new_pid = supervisor::spawn(&self.registry, spec)?;
        self.registry.set_status(new_pid, ChildStatus::Running);
        Ok(())
    }

    /// TERM stragglers in graduated windows, KILL at the hard deadline
    fn drain_all(&self) {
        let start = Instant::now();
        let mut window = 0usize;

        loop {
            let stragglers: Vec<Pid> = self
                .registry
                .snapshot_pids()
                .into_iter()
                .filter(|pid| {
                    self.registry
                        .get_status(*pid)
                        .map(|s| s <= ChildStatus::Running)
                        .unwrap_or(false)
                })
                .collect();
            if stragglers.is_empty() {
                break;
            }

            if start.elapsed() >= DRAIN_KILL_DEADLINE {
                for pid in &stragglers {
                    warn!("drain deadline hit, KILL {}", pid);
                    supervisor::send_signal(*pid, libc::SIGKILL);
                    supervisor::reap(*pid);
                    self.registry.set_status(*pid, ChildStatus::Reaped);
                }
                break;
            }

            let window_s = DRAIN_TERM_WINDOWS_S[window.min(DRAIN_TERM_WINDOWS_S.len() - 1)];
            for pid in &stragglers {
                supervisor::send_signal(*pid, libc::SIGTERM);
            }
            let window_end = Instant::now() + Duration::from_secs(window_s);
            while Instant::now() < window_end {
                let still_running = stragglers.iter().any(|pid| {
                    self.registry
                        .get_status(*pid)
                        .map(|s| s <= ChildStatus::Running)
                        .unwrap_or(false)
                });
                if !still_running {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            window += 1;
        }
    }

    /// Mark everything reaped and pull the records out of the registry
    fn collect(&self, escalation: &mut HashMap<Pid, Escalation>) -> Vec<ChildRecord> {
        let mut outcomes = Vec::new();
        for pid in self.registry.snapshot_pids() {
            self.registry.set_status(pid, ChildStatus::Reaped);
            if let Some(record) = self.registry.remove(pid, self.cleanup_progress) {
                outcomes.push(record);
            }
            escalation.remove(&pid);
        }
        outcomes.sort_by_key(|r| r.pid);
        outcomes
    }

    fn render(&mut self, active: usize, total: usize, aggregate: &ProgressFrame) {
        let line = render_line(active, total, aggregate);
        let padded = format!("\r{:<width$}", line, width = self.rendered_len);
        self.rendered_len = line.len();
        let mut err = std::io::stderr();
        let _ = err.write_all(padded.as_bytes());
        let _ = err.flush();
    }

    /// Log the final aggregate once and clear the in-place line
    fn finish_line(&mut self, label: &str, escalation: &HashMap<Pid, Escalation>) {
        let mut aggregate = ProgressFrame::default();
        for entry in escalation.values() {
            aggregate.absorb(&entry.last);
        }
        if aggregate.frame > 0 {
            info!(
                target: "status",
                "{} done: {}",
                label,
                render_line(0, escalation.len(), &aggregate)
            );
        } else {
            debug!("{} done with no frame progress to report", label);
        }
        self.clear_line();
    }

    fn clear_line(&mut self) {
        if self.rendered_len > 0 {
            let blank = format!("\r{:<width$}\r", "", width = self.rendered_len);
            let mut err = std::io::stderr();
            let _ = err.write_all(blank.as_bytes());
            let _ = err.flush();
            self.rendered_len = 0;
        }
    }
}

fn render_line(active: usize, total: usize, aggregate: &ProgressFrame) -> String {
    let clock = format_out_time(aggregate.out_time_us);
    if aggregate.frame > 0 {
        format!(
            "[{}/{} running] Frame {} ({} drp, {} dup); {}; FPS {:.2}; rate {} bits/s; Size {}",
            active,
            total,
            aggregate.frame,
            aggregate.drop_frames,
            aggregate.dup_frames,
            clock,
            aggregate.fps,
            aggregate.bitrate_bps,
            aggregate.total_size
        )
    } else {
        format!("[{}/{} running] {}", active, total, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChildStatus;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_strike_table() {
        assert_eq!(strike_action(0), None);
        assert_eq!(strike_action(1), Some(StrikeAction::Term));
        assert_eq!(strike_action(2), None);
        assert_eq!(strike_action(7), Some(StrikeAction::Kill));
        assert_eq!(strike_action(13), Some(StrikeAction::Reap));
        assert_eq!(strike_action(17), None);
        assert_eq!(strike_action(18), Some(StrikeAction::Restart));
        assert_eq!(strike_action(19), Some(StrikeAction::Restart));
    }

    #[test]
    fn test_render_line_with_and_without_frames() {
        let frame = ProgressFrame {
            frame: 1200,
            drop_frames: 2,
            dup_frames: 5,
            fps: 239.76,
            bitrate_bps: 870_900,
            total_size: 1_048_576,
            out_time_us: 2_000_000,
            ..Default::default()
        };
        assert_eq!(
            render_line(3, 4, &frame),
            "[3/4 running] Frame 1200 (2 drp, 5 dup); 00:00:02.000000; FPS 239.76; rate 870900 bits/s; Size 1048576"
        );

        let idle = ProgressFrame {
            out_time_us: 500_000,
            ..Default::default()
        };
        assert_eq!(render_line(1, 1, &idle), "[1/1 running] 00:00:00.500000");
    }

    #[test]
    fn test_await_stage_collects_finished_children() {
        let registry = WorkRegistry::new(false);
        let mut watchdog =
            Watchdog::new(Arc::clone(&registry), true).with_timing(4, Duration::from_millis(20));

        let mut pids = Vec::new();
        for i in 0..3 {
            let pid = supervisor::spawn(
                &registry,
                SpawnSpec::new(sh(&format!("echo worker-{}", i)), 1),
            )
            .unwrap();
            registry.set_status(pid, ChildStatus::Running);
            pids.push(pid);
        }

        let report = watchdog.await_stage("test stage").unwrap();
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes.iter().all(|r| r.exit_code == 0));
        // registry must be empty for the next stage
        assert!(registry.snapshot_pids().is_empty());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_await_stage_reports_failures() {
        let registry = WorkRegistry::new(false);
        let mut watchdog =
            Watchdog::new(Arc::clone(&registry), true).with_timing(4, Duration::from_millis(20));

        let pid = supervisor::spawn(&registry, SpawnSpec::new(sh("exit 5"), 2)).unwrap();
        registry.set_status(pid, ChildStatus::Running);

        let report = watchdog.await_stage("failing stage").unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].exit_code, 5);
        assert_eq!(report.outcomes[0].error_msg, "Exited with error 5");
    }

    #[test]
    fn test_frozen_worker_is_terminated_and_flagged() {
        let registry = WorkRegistry::new(false);
        let dir = tempfile::tempdir().unwrap();
        let prg = dir.path().join("w.prg");
        let mut watchdog =
            Watchdog::new(Arc::clone(&registry), true).with_timing(1, Duration::from_millis(50));

        // a sleeping child that never writes its progress file freezes
        // immediately under the shortened timeout
        let mut spec = SpawnSpec::new(sh("sleep 30"), 1);
        spec.progress_path = Some(prg);
        let pid = supervisor::spawn(&registry, spec).unwrap();
        registry.set_status(pid, ChildStatus::Running);

        // strike 1 sends TERM and marks for restart; the supervisor then
        // records a signal death and the stage drains
        let report = watchdog.await_stage("frozen stage").unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].exit_code, libc::SIGTERM);
        assert!(report.outcomes[0].restart_requested);
    }
}
