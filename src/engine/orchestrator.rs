//! Stage orchestration
//!
//! Builds the encoder argv for every stage from fixed flag groups, fans
//! out the stage's workers, hands the stage to the watchdog, and decides
//! success from the collected records.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::filters;
use crate::engine::supervisor::{self, SpawnSpec};
use crate::engine::watchdog::{StageReport, Watchdog};
use crate::engine::CleanupPolicy;
use crate::error::{SmoothXError, SmoothXResult, StageKind};
use crate::planner::{Job, SLOTS};
use crate::registry::{ChildStatus, StageParams, WorkRegistry};
use crate::streams;

/// Global options opening every encoder invocation
const ARGS_START: &[&str] = &["-hide_banner", "-loglevel", "level+info", "-y"];
/// Per-input options preceding each `-i`
const ARGS_INPUT_INIT: &[&str] = &[
    "-loglevel",
    "level+warning",
    "-nostats",
    "-colorspace",
    "bt709",
    "-color_range",
    "pc",
];
/// Extra per-input options for concat-demuxer inputs
const ARGS_CONCAT_INPUT: &[&str] = &["-f", "concat", "-safe", "0"];
/// Output format options for re-encoded matroska artifacts
const ARGS_FORMAT: &[&str] = &[
    "-colorspace",
    "bt709",
    "-color_range",
    "pc",
    "-pix_fmt",
    "yuv444p",
    "-f",
    "matroska",
    "-write_crc32",
    "0",
];
/// Intermediate codec: fast lossless with median prediction
const ARGS_INTERP_CODEC: &[&str] = &["-codec:v", "utvideo", "-pred", "median"];
/// Final codec group, tuned for editor-friendly high-quality masters
const ARGS_FINAL_CODEC: &[&str] = &[
    "-codec:v",
    "h264_nvenc",
    "-preset:v",
    "p7",
    "-tune:v",
    "hq",
    "-profile:v",
    "high444p",
    "-level:v",
    "5.2",
    "-rc:v",
    "vbr",
    "-rgb_mode",
    "yuv444",
    "-cq",
    "4",
    "-qmin",
    "1",
    "-qmax",
    "16",
    "-temporal_aq",
    "1",
    "-b_adapt",
    "0",
    "-b_ref_mode",
    "0",
    "-zerolatency",
    "1",
    "-multipass",
    "2",
    "-forced-idr",
    "1",
];

/// Decimation tuning per pass
const DECIMATE_UP: (u32, f64) = (2, 0.33);
const DECIMATE_DOWN: (u32, f64) = (3, 0.5);

/// The stage orchestrator; owns the pipeline run for one job
pub struct Orchestrator {
    job: Job,
    ffmpeg: PathBuf,
    registry: Arc<WorkRegistry>,
    watchdog: Watchdog,
    cleanup: CleanupPolicy,
    /// Drop+dup frames accumulated over the interpolation stages; decides
    /// the assemble filter variant. Written once per stage, never reduced.
    dropdups: u64,
}

impl Orchestrator {
    pub fn new(
        job: Job,
        ffmpeg: PathBuf,
        registry: Arc<WorkRegistry>,
        cleanup: CleanupPolicy,
    ) -> Self {
        let watchdog = Watchdog::new(Arc::clone(&registry), !cleanup.keeps_temporaries());
        Self {
            job,
            ffmpeg,
            registry,
            watchdog,
            cleanup,
            dropdups: 0,
        }
    }

    /// Run every stage in order; any failure halts the pipeline
    pub fn run(&mut self) -> SmoothXResult<()> {
        for index in 0..self.job.groups.len() {
            self.concat(index)?;
            self.segment(index)?;
            self.interp(index, StageKind::InterpUp)?;
            self.interp(index, StageKind::InterpDown)?;
        }
        self.write_final_lists()?;
        self.assemble()?;
        self.remove_temporaries();
        Ok(())
    }

    /// Concatenate a multi-source group into its cat file
    ///
    /// Single-source groups skip the stage entirely; their cat path
    /// already aliases the source.
    fn concat(&mut self, index: usize) -> SmoothXResult<()> {
        let group = self.job.groups[index].clone();
        if !group.needs_concat {
            debug!(
                "group {}: single source, concat skipped ({})",
                group.id,
                group.cat_path.display()
            );
            return Ok(());
        }

        let sources: Vec<PathBuf> = group
            .source_indices
            .iter()
            .map(|&i| self.job.sources[i].path.clone())
            .collect();
        write_concat_list(&group.temp.lst(), &sources).map_err(|e| SmoothXError::Stage {
            stage: StageKind::Concat,
            message: format!("writing {}: {}", group.temp.lst().display(), e),
        })?;

        info!("group {}: concatenating {} sources", group.id, sources.len());
        let mut argv = self.argv_start();
        argv.extend(strs(ARGS_INPUT_INIT));
        argv.extend(strs(ARGS_CONCAT_INPUT));
        argv.extend(["-i".into(), path_arg(&group.temp.lst())]);
        argv.extend(strs(&["-map", "0", "-codec", "copy"]));
        argv.extend(strs(&["-f", "matroska", "-write_crc32", "0"]));
        argv.push(path_arg(&group.temp.cat()));

        let report = self.run_stage(StageKind::Concat, vec![SpawnSpec::new(argv, group.id)])?;
        self.evaluate(StageKind::Concat, &report)
    }

    /// Cut a group's cat into four equal-duration stream copies
    fn segment(&mut self, index: usize) -> SmoothXResult<()> {
        let group = self.job.groups[index].clone();
        info!(
            "group {}: segmenting into {} x {}s",
            group.id,
            SLOTS,
            group.segment_len_s()
        );

        let mut argv = self.argv_start();
        argv.extend(strs(ARGS_INPUT_INIT));
        argv.extend(["-i".into(), path_arg(&group.cat_path)]);
        argv.extend(strs(&["-map", "0", "-codec", "copy"]));
        argv.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            group.segment_len_s().to_string(),
            "-segment_format".into(),
            "matroska".into(),
            "-reset_timestamps".into(),
            "1".into(),
        ]);
        argv.push(path_arg(&group.temp.tmp_pattern()));

        let report = self.run_stage(StageKind::Segment, vec![SpawnSpec::new(argv, group.id)])?;
        self.evaluate(StageKind::Segment, &report)
    }

    /// Run one interpolation pass with four parallel workers
    fn interp(&mut self, index: usize, stage: StageKind) -> SmoothXResult<()> {
        let group = self.job.groups[index].clone();
        let (fps, decimate) = match stage {
            StageKind::InterpUp => (self.job.fps.max_fps, DECIMATE_UP),
            _ => (self.job.fps.target_fps, DECIMATE_DOWN),
        };
        let source_exceeds_max = group.max_fps > self.job.fps.max_fps;

        info!(
            "group {}: {} pass to {} fps, {} workers",
            group.id, stage, fps, SLOTS
        );

        let mut specs = Vec::with_capacity(SLOTS);
        for slot in 0..SLOTS {
            let (input, output, progress) = match stage {
                StageKind::InterpUp => (
                    group.temp.tmp(slot),
                    group.temp.iup(slot),
                    group.temp.prgu(slot),
                ),
                _ => (
                    group.temp.iup(slot),
                    group.temp.idn(slot),
                    group.temp.prgd(slot),
                ),
            };

            let params = StageParams {
                stage,
                decimate_max: decimate.0,
                decimate_frac: decimate.1,
                target_fps: fps,
                source_slot: slot,
                target_slot: slot,
                alt_algorithm: false,
            };
            let graph = filters::interp_graph(&params, source_exceeds_max).render("0:v");

            let mut argv = self.argv_start();
            argv.extend(["-progress".into(), path_arg(&progress)]);
            argv.extend(strs(ARGS_INPUT_INIT));
            argv.extend(["-i".into(), path_arg(&input)]);
            argv.extend(["-filter_complex".into(), graph, "-map".into(), "[out]".into()]);
            argv.extend(strs(ARGS_INTERP_CODEC));
            argv.extend(strs(ARGS_FORMAT));
            argv.push(path_arg(&output));

            let mut spec = SpawnSpec::new(argv, group.id);
            spec.stage_params = Some(params);
            spec.progress_path = Some(progress);
            spec.source_template = Some(path_arg(&input));
            spec.target_template = Some(path_arg(&output));
            specs.push(spec);
        }

        let report = self.run_stage(stage, specs)?;
        // write-once carry per stage, monotone by construction
        self.dropdups += report.dropdups;
        self.evaluate(stage, &report)
    }

    /// Write the assemble-stage concat lists (video and audio)
    fn write_final_lists(&mut self) -> SmoothXResult<()> {
        let list_err = |path: &Path, e: std::io::Error| SmoothXError::Stage {
            stage: StageKind::WriteList,
            message: format!("writing {}: {}", path.display(), e),
        };

        let mut video_parts = Vec::new();
        let mut audio_parts = Vec::new();
        for group in &self.job.groups {
            for slot in 0..SLOTS {
                video_parts.push(group.temp.idn(slot));
            }
            audio_parts.push(group.cat_path.clone());
        }

        let vlst = self.job.final_video_list();
        write_concat_list(&vlst, &video_parts).map_err(|e| list_err(&vlst, e))?;
        debug!(
            "assemble video list written: {} ({} parts)",
            vlst.display(),
            video_parts.len()
        );

        // a single group feeds its cat straight into assemble; only
        // multi-group jobs need the audio joined by the concat demuxer
        if self.job.groups.len() > 1 {
            let alst = self.job.final_audio_list();
            write_concat_list(&alst, &audio_parts).map_err(|e| list_err(&alst, e))?;
            debug!(
                "assemble audio list written: {} ({} parts)",
                alst.display(),
                audio_parts.len()
            );
        }
        Ok(())
    }

    /// Produce the final container (and the voice .wav when requested)
    fn assemble(&mut self) -> SmoothXResult<()> {
        let dropdups_seen = self.dropdups > 0;
        info!(
            "assembling {} at {} fps ({} interpolation)",
            self.job.output_path.display(),
            self.job.fps.target_fps,
            if dropdups_seen { "mixing" } else { "plain" }
        );

        let graph = filters::assemble_graph(self.job.fps.target_fps, dropdups_seen).render("0:v");

        let mut argv = self.argv_start();
        argv.extend(strs(ARGS_INPUT_INIT));
        argv.extend(strs(ARGS_CONCAT_INPUT));
        argv.extend(["-i".into(), path_arg(&self.job.final_video_list())]);
        argv.extend(strs(ARGS_INPUT_INIT));
        if self.job.groups.len() > 1 {
            argv.extend(strs(ARGS_CONCAT_INPUT));
            argv.extend(["-i".into(), path_arg(&self.job.final_audio_list())]);
        } else {
            argv.extend(["-i".into(), path_arg(&self.job.groups[0].cat_path)]);
        }
        argv.extend(["-filter_complex".into(), graph, "-map".into(), "[out]".into()]);
        argv.extend(strs(ARGS_FINAL_CODEC));
        argv.extend(streams::assemble_audio_args(
            self.job.main_audio_channels(),
            1,
        ));
        argv.extend(strs(ARGS_FORMAT));
        argv.push(path_arg(&self.job.output_path));

        if self.job.split_voice && self.job.has_voice_stream() {
            let wav = self.job.voice_path();
            info!("splitting voice channel into {}", wav.display());
            argv.extend(streams::voice_split_args(1, &wav));
        }

        let report = self.run_stage(StageKind::Assemble, vec![SpawnSpec::new(argv, 0)])?;
        self.evaluate(StageKind::Assemble, &report)
    }

    /// Spawn a stage's workers and watch them to completion
    fn run_stage(
        &mut self,
        stage: StageKind,
        specs: Vec<SpawnSpec>,
    ) -> SmoothXResult<StageReport> {
        if self.registry.active_count() != 0 {
            return Err(SmoothXError::Internal {
                message: format!("{} starting with children still registered", stage),
            });
        }

        for spec in specs {
            match supervisor::spawn(&self.registry, spec) {
                Ok(pid) => self.registry.set_status(pid, ChildStatus::Running),
                Err(e) => {
                    // release the workers already spawned before bailing
                    for pid in self.registry.snapshot_pids() {
                        self.registry.set_status(pid, ChildStatus::Running);
                        supervisor::send_signal(pid, libc::SIGTERM);
                    }
                    let _ = self.watchdog.await_stage(&stage.to_string());
                    return Err(e);
                }
            }
        }
        self.watchdog.await_stage(&stage.to_string())
    }

    /// A stage succeeds iff every worker exited 0 and no error-classed
    /// line appeared on any stderr
    fn evaluate(&self, stage: StageKind, report: &StageReport) -> SmoothXResult<()> {
        let width = self.registry.max_pid_width();
        for record in &report.outcomes {
            debug!(
                "{}: [{:>width$}] exit {} {}",
                stage,
                record.pid,
                record.exit_code,
                record.error_msg,
                width = width
            );
        }
        for record in &report.outcomes {
            if record.exit_code != 0 {
                return Err(SmoothXError::Stage {
                    stage,
                    message: format!("worker {}: {}", record.pid, record.error_msg),
                });
            }
            if let Some(line) = record.stderr_buf.iter().find(|l| is_error_line(l)) {
                return Err(SmoothXError::Stage {
                    stage,
                    message: format!("worker {} reported: {}", record.pid, line),
                });
            }
        }
        Ok(())
    }

    /// Delete (or, in debug mode, log) every temporary artifact
    fn remove_temporaries(&self) {
        for group in &self.job.groups {
            for path in group.temp.all_paths() {
                self.cleanup.remove(&path);
            }
        }
        self.cleanup.remove(&self.job.final_video_list());
        self.cleanup.remove(&self.job.final_audio_list());
    }

    fn argv_start(&self) -> Vec<String> {
        let mut argv = vec![self.ffmpeg.display().to_string()];
        argv.extend(strs(ARGS_START));
        argv
    }
}

/// Stderr lines that fail a stage even on a zero exit
fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("[error]") || lower.contains("[fatal]") || lower.contains("[panic]")
}

/// Write a concat-demuxer list file
fn write_concat_list(path: &Path, parts: &[PathBuf]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for part in parts {
        // single quotes in the path are closed, escaped and reopened, per
        // the demuxer's quoting rules
        let escaped = part.display().to_string().replace('\'', "'\\''");
        writeln!(file, "file '{}'", escaped)?;
    }
    file.flush()
}

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_line_classification() {
        assert!(is_error_line("[matroska @ 0x1] [error] Invalid track number"));
        assert!(is_error_line("[fatal] out of memory"));
        assert!(!is_error_line("[warning] deprecated pixel format"));
        assert!(!is_error_line("frame=100 fps=60"));
    }

    #[test]
    fn test_write_concat_list_quotes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let lst = dir.path().join("c.lst");
        write_concat_list(
            &lst,
            &[
                PathBuf::from("/rec/plain.mkv"),
                PathBuf::from("/rec/it's.mkv"),
            ],
        )
        .unwrap();
        let text = std::fs::read_to_string(&lst).unwrap();
        assert_eq!(
            text,
            "file '/rec/plain.mkv'\nfile '/rec/it'\\''s.mkv'\n"
        );
    }

    #[test]
    fn test_fixed_flag_groups_are_bit_exact() {
        assert_eq!(ARGS_START.join(" "), "-hide_banner -loglevel level+info -y");
        assert_eq!(
            ARGS_INPUT_INIT.join(" "),
            "-loglevel level+warning -nostats -colorspace bt709 -color_range pc"
        );
        assert_eq!(ARGS_CONCAT_INPUT.join(" "), "-f concat -safe 0");
        assert_eq!(
            ARGS_FORMAT.join(" "),
            "-colorspace bt709 -color_range pc -pix_fmt yuv444p -f matroska -write_crc32 0"
        );
        assert_eq!(ARGS_INTERP_CODEC.join(" "), "-codec:v utvideo -pred median");
        assert_eq!(
            ARGS_FINAL_CODEC.join(" "),
            "-codec:v h264_nvenc -preset:v p7 -tune:v hq -profile:v high444p -level:v 5.2 \
             -rc:v vbr -rgb_mode yuv444 -cq 4 -qmin 1 -qmax 16 -temporal_aq 1 -b_adapt 0 \
             -b_ref_mode 0 -zerolatency 1 -multipass 2 -forced-idr 1"
        );
    }
}
