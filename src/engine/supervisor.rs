//! Child process supervision
//!
//! One supervisor thread per external command: it registers the child,
//! waits for the startup handshake, streams both output channels into the
//! child's record, forwards termination requests read from the death
//! level, and decodes the final exit status.

use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{SmoothXError, SmoothXResult};
use crate::registry::{
    ChildRecord, ChildStatus, OutputChannel, Pid, StageParams, StatusCell, WorkRegistry,
};

/// Pause between drain iterations; bounds death-level reaction latency
const DRAIN_INTERVAL: Duration = Duration::from_millis(20);
/// Handshake poll interval
const HANDSHAKE_INTERVAL: Duration = Duration::from_micros(500);

/// Everything needed to launch and register one child
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub gid: u32,
    pub stage_params: Option<StageParams>,
    pub progress_path: Option<PathBuf>,
    pub source_template: Option<String>,
    pub target_template: Option<String>,
}

impl SpawnSpec {
    pub fn new(argv: Vec<String>, gid: u32) -> Self {
        Self {
            argv,
            gid,
            stage_params: None,
            progress_path: None,
            source_template: None,
            target_template: None,
        }
    }
}

/// Launch a command and hand it to a supervisor thread
///
/// The record enters the registry in `Created`; supervision (and thus
/// termination forwarding) begins once the caller transitions it to
/// `Running`.
pub fn spawn(registry: &Arc<WorkRegistry>, spec: SpawnSpec) -> SmoothXResult<Pid> {
    if spec.argv.is_empty() {
        return Err(SmoothXError::Internal {
            message: "spawn with empty argv".to_string(),
        });
    }

    let mut child = Command::new(&spec.argv[0])
        .args(&spec.argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let pid = child.id();
    debug!("spawned pid {}: {}", pid, spec.argv.join(" "));

    let mut record = ChildRecord::new(pid, spec.gid, spec.argv);
    record.stage_params = spec.stage_params;
    record.progress_path = spec.progress_path;
    record.source_template = spec.source_template;
    record.target_template = spec.target_template;
    if let Err(e) = registry.add(record) {
        // never leave an untracked child behind
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }

    let cell = registry
        .status_cell(pid)
        .expect("record registered just above");
    let registry = Arc::clone(registry);
    std::thread::Builder::new()
        .name(format!("supervise-{}", pid))
        .spawn(move || supervise(registry, &mut child, pid, cell))
        .map_err(SmoothXError::Io)?;

    Ok(pid)
}

fn supervise(registry: Arc<WorkRegistry>, child: &mut Child, pid: Pid, cell: StatusCell) {
    // startup handshake: the parent attaches metadata and flips us to
    // Running before supervision begins; a hard death level breaks the
    // wait so no supervisor can hang on an abandoned handshake
    while cell.get() == ChildStatus::Created {
        if WorkRegistry::read_death() >= 4 {
            break;
        }
        std::thread::sleep(HANDSHAKE_INTERVAL);
    }

    let mut stdout = child.stdout.take().map(|s| {
        set_nonblocking(s.as_raw_fd());
        LineReader::new(ReadEnd::Out(s))
    });
    let mut stderr = child.stderr.take().map(|s| {
        set_nonblocking(s.as_raw_fd());
        LineReader::new(ReadEnd::Err(s))
    });

    let mut term_sent = false;
    let mut kill_sent = false;

    let status = loop {
        if let Some(reader) = stdout.as_mut() {
            reader.drain(&registry, pid, OutputChannel::Stdout);
        }
        if let Some(reader) = stderr.as_mut() {
            reader.drain(&registry, pid, OutputChannel::Stderr);
        }

        let death = WorkRegistry::read_death();
        if death >= 1 && !term_sent {
            debug!("death level {}: TERM to {}", death, pid);
            send_signal(pid, libc::SIGTERM);
            term_sent = true;
        }
        if death >= 4 && !kill_sent {
            debug!("death level {}: KILL to {}", death, pid);
            send_signal(pid, libc::SIGKILL);
            kill_sent = true;
        }

        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => std::thread::sleep(DRAIN_INTERVAL),
            Err(e) => {
                // the watchdog's synchronous reap can win the wait race
                warn!("lost child {}: {}", pid, e);
                break None;
            }
        }
    };

    // residual bytes written between the last drain and exit
    if let Some(reader) = stdout.as_mut() {
        reader.finish(&registry, pid, OutputChannel::Stdout);
    }
    if let Some(reader) = stderr.as_mut() {
        reader.finish(&registry, pid, OutputChannel::Stderr);
    }

    let (exit_code, error_msg, final_status) = match status {
        Some(status) => decode_exit(status),
        None => (-1, "Lost child process".to_string(), ChildStatus::Killed),
    };
    registry.set_exit(pid, exit_code, error_msg);
    if cell.get() != ChildStatus::Reaped {
        cell.set(final_status);
    }
}

/// Decode a wait status into (exit_code, error_msg, record status)
fn decode_exit(status: ExitStatus) -> (i32, String, ChildStatus) {
    if let Some(signal) = status.signal() {
        return (
            signal,
            format!("Killed by signal {}", signal),
            ChildStatus::Killed,
        );
    }
    let code = status.code().unwrap_or(-1);
    if code == 0 {
        (0, String::new(), ChildStatus::Finished)
    } else {
        (
            code,
            format!("Exited with error {}", code),
            ChildStatus::Killed,
        )
    }
}

/// Forward a signal to one pid
pub fn send_signal(pid: Pid, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Collect an exited child without blocking; true when it was collected
pub fn reap(pid: Pid) -> bool {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    rc == pid as libc::pid_t
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

enum ReadEnd {
    Out(ChildStdout),
    Err(ChildStderr),
}

impl Read for ReadEnd {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ReadEnd::Out(s) => s.read(buf),
            ReadEnd::Err(s) => s.read(buf),
        }
    }
}

/// Accumulates pipe bytes and emits complete lines into the record
struct LineReader {
    source: ReadEnd,
    partial: Vec<u8>,
    closed: bool,
}

impl LineReader {
    fn new(source: ReadEnd) -> Self {
        Self {
            source,
            partial: Vec::new(),
            closed: false,
        }
    }

    fn drain(&mut self, registry: &WorkRegistry, pid: Pid, channel: OutputChannel) {
        if self.closed {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match self.source.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.partial.extend_from_slice(&buf[..n]);
                    self.flush_lines(registry, pid, channel);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn flush_lines(&mut self, registry: &WorkRegistry, pid: Pid, channel: OutputChannel) {
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            registry.append_line(pid, channel, text);
        }
    }

    fn finish(&mut self, registry: &WorkRegistry, pid: Pid, channel: OutputChannel) {
        self.drain(registry, pid, channel);
        if !self.partial.is_empty() {
            let text = String::from_utf8_lossy(&self.partial).to_string();
            registry.append_line(pid, channel, text);
            self.partial.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn wait_done(registry: &Arc<WorkRegistry>, pid: Pid) -> ChildRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = registry.get_status(pid).unwrap();
            if status >= ChildStatus::Killed {
                return registry.get(pid).unwrap();
            }
            assert!(Instant::now() < deadline, "child {} never finished", pid);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_clean_exit_captures_stdout() {
        let registry = WorkRegistry::new(false);
        let pid = spawn(&registry, SpawnSpec::new(sh("echo hello; echo world >&2"), 1)).unwrap();
        assert_eq!(registry.get_status(pid), Some(ChildStatus::Created));

        registry.set_status(pid, ChildStatus::Running);
        let record = wait_done(&registry, pid);

        assert_eq!(record.status.get(), ChildStatus::Finished);
        assert_eq!(record.exit_code, 0);
        assert!(record.error_msg.is_empty());
        assert_eq!(record.stdout_buf, vec!["hello"]);
        assert_eq!(record.stderr_buf, vec!["world"]);
    }

    #[test]
    fn test_nonzero_exit_is_decoded() {
        let registry = WorkRegistry::new(false);
        let pid = spawn(&registry, SpawnSpec::new(sh("exit 3"), 1)).unwrap();
        registry.set_status(pid, ChildStatus::Running);
        let record = wait_done(&registry, pid);

        assert_eq!(record.status.get(), ChildStatus::Killed);
        assert_eq!(record.exit_code, 3);
        assert_eq!(record.error_msg, "Exited with error 3");
    }

    #[test]
    fn test_signal_death_is_decoded() {
        let registry = WorkRegistry::new(false);
        let pid = spawn(&registry, SpawnSpec::new(sh("kill -TERM $$"), 1)).unwrap();
        registry.set_status(pid, ChildStatus::Running);
        let record = wait_done(&registry, pid);

        assert_eq!(record.status.get(), ChildStatus::Killed);
        assert_eq!(record.exit_code, libc::SIGTERM);
        assert_eq!(record.error_msg, format!("Killed by signal {}", libc::SIGTERM));
    }

    #[test]
    fn test_partial_final_line_is_kept() {
        let registry = WorkRegistry::new(false);
        let pid = spawn(&registry, SpawnSpec::new(sh("printf 'no newline'"), 1)).unwrap();
        registry.set_status(pid, ChildStatus::Running);
        let record = wait_done(&registry, pid);
        assert_eq!(record.stdout_buf, vec!["no newline"]);
    }

    #[test]
    fn test_decode_exit_table() {
        // forged statuses cover the raw decoding rules
        let clean = ExitStatus::from_raw(0);
        assert_eq!(decode_exit(clean), (0, String::new(), ChildStatus::Finished));

        let failed = ExitStatus::from_raw(2 << 8);
        assert_eq!(
            decode_exit(failed),
            (2, "Exited with error 2".to_string(), ChildStatus::Killed)
        );

        let signalled = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(
            decode_exit(signalled),
            (
                libc::SIGKILL,
                format!("Killed by signal {}", libc::SIGKILL),
                ChildStatus::Killed
            )
        );
    }
}
