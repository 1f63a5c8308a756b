//! Logging configuration and output formatting
//!
//! Two sinks share one pipe-delimited line format: the job log file next to
//! the output receives everything down to DEBUG, the console receives INFO
//! and above. STATUS lines are ordinary INFO events emitted with
//! `target: "status"`.

use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::error::SmoothXResult;

/// Target used to emit STATUS-level lines
pub const STATUS_TARGET: &str = "status";

/// Derive the log file path from the output path (extension replaced)
pub fn log_path_for(output: &Path) -> PathBuf {
    output.with_extension("log")
}

/// `YYYY-MM-DD HH:MM:SS|LEVEL|[PID] loc|message`
struct PipeFormat;

fn level_name(event: &Event<'_>) -> &'static str {
    if event.metadata().target() == STATUS_TARGET {
        return "STATUS";
    }
    match *event.metadata().level() {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG | Level::TRACE => "DEBUG",
    }
}

impl<S, N> FormatEvent<S, N> for PipeFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");

        let loc = match (meta.file(), meta.line()) {
            (Some(file), Some(line)) => {
                let base = file.rsplit('/').next().unwrap_or(file);
                format!("{}:{}", base, line)
            }
            _ => meta.target().to_string(),
        };

        write!(
            writer,
            "{}|{}|[{}] {}|",
            timestamp,
            level_name(event),
            std::process::id(),
            loc
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Cloneable writer sharing one open log file across layers
#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl IoWrite for SharedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.flush()
    }
}

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = SharedFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize the global subscriber with the file and console sinks
///
/// The file always records down to DEBUG; only the console is cut at
/// INFO. Returns the log path so the failure trailer can point at it.
pub fn init(log_path: &Path) -> SmoothXResult<PathBuf> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let shared = SharedFile(Arc::new(Mutex::new(file)));

    let file_layer = tracing_subscriber::fmt::layer()
        .event_format(PipeFormat)
        .with_writer(shared)
        .with_ansi(false)
        .with_filter(tracing::level_filters::LevelFilter::DEBUG);

    let console_layer = tracing_subscriber::fmt::layer()
        .event_format(PipeFormat)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_filter(tracing::level_filters::LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(log_path.to_path_buf())
}
