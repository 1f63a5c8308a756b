//! SmoothX batch remaster tool
//!
//! Overhauls high-framerate gameplay recordings into cleanly interpolated
//! editor-friendly master files by driving the external encoder through a
//! parallel multi-stage pipeline with per-worker supervision and freeze
//! recovery.
//!
//! # Usage
//!
//! ```bash
//! smoothx -i match.mkv -o match_master.mkv
//! smoothx -i part1.mkv -i part2.mkv -o session.mkv --splitaudio
//! smoothx -i slow.mkv -o slow_60.mkv --upgrade --tempdir /scratch
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use clap::Parser;
use tracing::{error, info};

mod cli;
mod engine;
mod error;
mod planner;
mod probe;
mod registry;
mod streams;
mod utils;

use cli::Cli;
use error::SmoothXError;
use registry::WorkRegistry;
use utils::logging;

/// Consecutive signals received; the 5th gives up on graceful teardown
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Async-signal-safe handler: one atomic bump, everything else is drawn
/// by the watchdog on its next tick
extern "C" fn on_termination_signal(_signal: libc::c_int) {
    let count = SIGNAL_COUNT.fetch_add(1, Ordering::AcqRel) + 1;
    WorkRegistry::bump_death();
    if count >= 5 {
        unsafe { libc::_exit(43) };
    }
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_termination_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_termination_signal as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, on_termination_signal as libc::sighandler_t);
    }
}

fn main() {
    let cli = Cli::parse();

    let log_path = logging::log_path_for(&cli.output);
    if let Err(e) = logging::init(&log_path) {
        eprintln!("cannot open log file {}: {}", log_path.display(), e);
        std::process::exit(1);
    }

    install_signal_handlers();
    info!("smoothx {} starting", env!("CARGO_PKG_VERSION"));
    let started = std::time::Instant::now();

    let code = match cli::commands::run(&cli) {
        Ok(()) => {
            info!(
                target: "status",
                "completed in {}",
                utils::time::format_elapsed(started.elapsed())
            );
            info!(target: "status", "Program finished");
            0
        }
        Err(e) => {
            if matches!(
                e.downcast_ref::<SmoothXError>(),
                Some(SmoothXError::Internal { .. })
            ) {
                // invariant breach: make sure every supervisor stands down
                WorkRegistry::raise_death(5);
            }
            error!("{:#}", e);
            info!(target: "status", "Program FAILED!");
            eprintln!("See {} for details", log_path.display());
            e.downcast_ref::<SmoothXError>()
                .map(SmoothXError::exit_code)
                .unwrap_or(1)
        }
    };

    std::process::exit(code);
}
