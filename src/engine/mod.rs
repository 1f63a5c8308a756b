//! Pipeline engine module
//!
//! Everything that runs after planning: worker supervision, the progress
//! watchdog, filter construction, and the stage orchestrator chaining
//! concat → segment → interp-up → interp-down → assemble.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::SmoothXResult;
use crate::planner::Job;
use crate::registry::WorkRegistry;

pub mod filters;
pub mod orchestrator;
pub mod progress;
pub mod supervisor;
pub mod watchdog;

pub use orchestrator::Orchestrator;
pub use watchdog::Watchdog;

/// Routes every temporary-file removal through one switch
///
/// In debug mode all temporaries are retained and their paths logged so a
/// failed run can be dissected.
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    keep: bool,
}

impl CleanupPolicy {
    pub fn new(keep_temporaries: bool) -> Self {
        Self {
            keep: keep_temporaries,
        }
    }

    pub fn keeps_temporaries(&self) -> bool {
        self.keep
    }

    /// Remove a temporary, or log that it was kept
    pub fn remove(&self, path: &Path) {
        if self.keep {
            if path.exists() {
                info!("retaining temporary {}", path.display());
            }
            return;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed temporary {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("could not remove {}: {}", path.display(), e),
        }
    }
}

/// Run the whole pipeline for a planned job
pub fn run_pipeline(
    job: Job,
    ffmpeg: PathBuf,
    registry: Arc<WorkRegistry>,
) -> SmoothXResult<()> {
    let cleanup = CleanupPolicy::new(job.keep_temporaries);
    let mut orchestrator = Orchestrator::new(job, ffmpeg, registry, cleanup);
    orchestrator.run()
}
