//! Command implementation

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::args::Cli;
use crate::engine;
use crate::planner::{JobPlanner, PlanRequest};
use crate::probe::SourceInspector;
use crate::registry::WorkRegistry;
use crate::utils::require_tool;

/// Plan and execute the remaster job described by the CLI
pub fn run(cli: &Cli) -> Result<()> {
    let ffmpeg = require_tool("ffmpeg")?;
    let ffprobe = require_tool("ffprobe")?;
    debug!(
        "external tools: {} / {}",
        ffmpeg.display(),
        ffprobe.display()
    );

    let request = PlanRequest {
        inputs: cli.inputs.clone(),
        output: cli.output.clone(),
        temp_dir: cli.tempdir.clone(),
        split_voice: cli.splitaudio,
        force_upgrade: cli.upgrade,
        user_max_fps: cli.maxfps,
        user_target_fps: cli.targetfps,
        keep_temporaries: cli.debug,
    };

    let planner = JobPlanner::new(SourceInspector::new(ffprobe));
    let job = planner.plan(&request).context("job planning failed")?;
    info!(
        "job planned: {} sources in {} groups, output {}",
        job.sources.len(),
        job.groups.len(),
        job.output_path.display()
    );

    let registry = WorkRegistry::new(cli.lock_debug);
    engine::run_pipeline(job, ffmpeg, registry).context("pipeline failed")?;

    info!("output written: {}", cli.output.display());
    Ok(())
}
