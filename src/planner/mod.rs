//! Job planning module
//!
//! Converts validated CLI inputs into the immutable [`Job`] the engine
//! executes: probed sources, compatible source-groups, the frame-rate
//! decision, the space budget, and the templated names of every temporary
//! artifact.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{SmoothXError, SmoothXResult};
use crate::probe::{Source, SourceInspector};

pub mod fps;
pub mod grouping;
pub mod space;

pub use fps::FpsPolicy;

/// Workers per interpolation pass; also the segment fan-out
pub const SLOTS: usize = 4;

/// Templated file names for one source-group's derived artifacts
///
/// Expansion is a pure function of (gid, main pid, slot): the same inputs
/// always yield the same paths.
#[derive(Debug, Clone, Serialize)]
pub struct TempPlan {
    base: PathBuf,
}

impl TempPlan {
    pub fn new(directory: &Path, main_pid: u32, gid: u32) -> Self {
        Self {
            base: directory.join(format!("smoothx_{}_g{}", main_pid, gid)),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Concatenation output, one .mkv per group
    pub fn cat(&self) -> PathBuf {
        self.with_suffix("_cat.mkv")
    }

    /// Concat demuxer list file
    pub fn lst(&self) -> PathBuf {
        self.with_suffix("_cat.lst")
    }

    /// Segment output pattern, `%d` expanded by the encoder
    pub fn tmp_pattern(&self) -> PathBuf {
        self.with_suffix("_seg%d.mkv")
    }

    /// One expanded segment file
    pub fn tmp(&self, slot: usize) -> PathBuf {
        self.with_suffix(&format!("_seg{}.mkv", slot))
    }

    /// Up-interpolated intermediate
    pub fn iup(&self, slot: usize) -> PathBuf {
        self.with_suffix(&format!("_iup{}.mkv", slot))
    }

    /// Down-interpolated intermediate
    pub fn idn(&self, slot: usize) -> PathBuf {
        self.with_suffix(&format!("_idn{}.mkv", slot))
    }

    /// Up-pass worker progress file
    pub fn prgu(&self, slot: usize) -> PathBuf {
        self.with_suffix(&format!("_prgu{}.prg", slot))
    }

    /// Down-pass worker progress file
    pub fn prgd(&self, slot: usize) -> PathBuf {
        self.with_suffix(&format!("_prgd{}.prg", slot))
    }

    /// Every path a cleanly completed run must have removed
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.cat(), self.lst()];
        for slot in 0..SLOTS {
            paths.push(self.tmp(slot));
            paths.push(self.iup(slot));
            paths.push(self.idn(slot));
            paths.push(self.prgu(slot));
            paths.push(self.prgd(slot));
        }
        paths
    }
}

/// A contiguous run of sources sharing codec layout, channel count and
/// location; the unit of segmentation
#[derive(Debug, Clone, Serialize)]
pub struct SourceGroup {
    /// 1-based id; 0 is reserved for probe and capture records
    pub id: u32,
    pub directory: PathBuf,
    pub total_duration_s: f64,
    /// Fastest probed rate among the members
    pub max_fps: u32,
    pub source_indices: Vec<usize>,
    pub temp: TempPlan,
    /// Concat input: the group's cat file, or the single source directly
    pub cat_path: PathBuf,
    pub needs_concat: bool,
}

impl SourceGroup {
    /// Segment length in seconds: ⌊1 + total/4⌋
    pub fn segment_len_s(&self) -> u64 {
        (1.0 + self.total_duration_s / SLOTS as f64).floor() as u64
    }
}

/// Everything the pipeline needs, assembled once and then immutable
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub output_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub split_voice: bool,
    pub force_upgrade: bool,
    pub fps: FpsPolicy,
    pub sources: Vec<Source>,
    pub groups: Vec<SourceGroup>,
    pub main_pid: u32,
    /// Retain temporaries and log their paths instead of deleting
    pub keep_temporaries: bool,
}

impl Job {
    /// Concat list of all down-interpolated intermediates, assemble input 0
    pub fn final_video_list(&self) -> PathBuf {
        self.list_dir()
            .join(format!("smoothx_{}_final_v.lst", self.main_pid))
    }

    /// Concat list of the per-group cat files, assemble audio input
    pub fn final_audio_list(&self) -> PathBuf {
        self.list_dir()
            .join(format!("smoothx_{}_final_a.lst", self.main_pid))
    }

    /// Sibling .wav receiving the voice channel when splitting is on
    pub fn voice_path(&self) -> PathBuf {
        self.output_path.with_extension("wav")
    }

    fn list_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.groups[0].directory.clone())
    }

    /// True when any probed source carries a secondary audio stream
    pub fn has_voice_stream(&self) -> bool {
        self.sources.iter().any(Source::has_voice_stream)
    }

    /// Channel count of the widest main audio stream across sources
    pub fn main_audio_channels(&self) -> u32 {
        self.sources
            .iter()
            .map(Source::main_audio_channels)
            .max()
            .unwrap_or(0)
    }
}

/// Validated CLI inputs handed to the planner
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub split_voice: bool,
    pub force_upgrade: bool,
    pub user_max_fps: Option<u32>,
    pub user_target_fps: Option<u32>,
    pub keep_temporaries: bool,
}

/// The job planner: validation, probing, grouping, budgeting, templating
pub struct JobPlanner {
    inspector: SourceInspector,
}

impl JobPlanner {
    pub fn new(inspector: SourceInspector) -> Self {
        Self { inspector }
    }

    pub fn plan(&self, request: &PlanRequest) -> SmoothXResult<Job> {
        validate_request(request)?;

        let mut sources = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            let source = self.inspector.inspect(input)?;
            info!(
                "probed {}: {:.1}s, {} fps, {} bit/s, {} streams",
                input.display(),
                source.duration_s,
                source.avg_fps,
                source.bitrate_bps,
                source.streams.len()
            );
            sources.push(source);
        }

        let spans = grouping::partition(&sources, request.temp_dir.is_some())?;
        space::check_budget(&sources, request.temp_dir.as_deref())?;

        let source_max_fps = sources.iter().map(|s| s.avg_fps).max().unwrap_or(0);
        let fps = FpsPolicy::determine(
            source_max_fps,
            request.force_upgrade,
            request.user_max_fps,
            request.user_target_fps,
        );
        info!(
            "frame rates: target {} fps, intermediate max {} fps",
            fps.target_fps, fps.max_fps
        );

        let main_pid = std::process::id();
        let mut groups = Vec::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            let gid = (i + 1) as u32;
            let first = &sources[span.source_indices[0]];
            let directory = request
                .temp_dir
                .clone()
                .unwrap_or_else(|| first.directory.clone());
            let temp = TempPlan::new(&directory, main_pid, gid);

            let needs_concat = span.source_indices.len() > 1;
            let cat_path = if needs_concat {
                temp.cat()
            } else {
                first.path.clone()
            };

            groups.push(SourceGroup {
                id: gid,
                directory,
                total_duration_s: span
                    .source_indices
                    .iter()
                    .map(|&i| sources[i].duration_s)
                    .sum(),
                max_fps: span
                    .source_indices
                    .iter()
                    .map(|&i| sources[i].avg_fps)
                    .max()
                    .unwrap_or(0),
                source_indices: span.source_indices.clone(),
                temp,
                cat_path,
                needs_concat,
            });
        }

        let job = Job {
            output_path: request.output.clone(),
            temp_dir: request.temp_dir.clone(),
            split_voice: request.split_voice,
            force_upgrade: request.force_upgrade,
            fps,
            sources,
            groups,
            main_pid,
            keep_temporaries: request.keep_temporaries,
        };

        match serde_json::to_string(&job) {
            Ok(json) => debug!("planned job: {}", json),
            Err(e) => debug!("job plan not serializable: {}", e),
        }

        Ok(job)
    }
}

fn validate_request(request: &PlanRequest) -> SmoothXResult<()> {
    let usage = |message: String| SmoothXError::Usage { message };

    if request.inputs.is_empty() {
        return Err(usage("at least one input is required".to_string()));
    }
    for input in &request.inputs {
        let meta = std::fs::metadata(input)
            .map_err(|_| usage(format!("input does not exist: {}", input.display())))?;
        if meta.len() == 0 {
            return Err(usage(format!("input is empty: {}", input.display())));
        }
        if *input == request.output {
            return Err(usage(format!(
                "input and output are the same file: {}",
                input.display()
            )));
        }
    }

    match request.output.extension().and_then(|e| e.to_str()) {
        Some("mkv") => {}
        _ => {
            return Err(usage(format!(
                "output must end in .mkv: {}",
                request.output.display()
            )))
        }
    }
    if request.output.exists() {
        return Err(usage(format!(
            "output already exists: {}",
            request.output.display()
        )));
    }
    if let Some(temp) = &request.temp_dir {
        if !temp.is_dir() {
            return Err(usage(format!(
                "temp dir does not exist: {}",
                temp.display()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_template_expansion_is_pure() {
        let a = TempPlan::new(Path::new("/work"), 4242, 1);
        let b = TempPlan::new(Path::new("/work"), 4242, 1);
        assert_eq!(a.cat(), b.cat());
        assert_eq!(a.tmp(3), b.tmp(3));
        assert_eq!(a.prgu(0), b.prgu(0));
    }

    #[test]
    fn test_templates_embed_pid_and_gid() {
        let plan = TempPlan::new(Path::new("/work"), 777, 2);
        let cat = plan.cat().display().to_string();
        assert!(cat.contains("777"));
        assert!(cat.contains("g2"));
        assert_eq!(plan.tmp_pattern().display().to_string(), "/work/smoothx_777_g2_seg%d.mkv");
        assert_eq!(plan.iup(1).display().to_string(), "/work/smoothx_777_g2_iup1.mkv");
        assert_eq!(plan.idn(3).display().to_string(), "/work/smoothx_777_g2_idn3.mkv");
        assert_eq!(plan.prgd(0).display().to_string(), "/work/smoothx_777_g2_prgd0.prg");
    }

    #[test]
    fn test_all_paths_covers_every_slot() {
        let plan = TempPlan::new(Path::new("/work"), 1, 1);
        let paths = plan.all_paths();
        // cat + lst + 4 slots x (seg, iup, idn, prgu, prgd)
        assert_eq!(paths.len(), 2 + SLOTS * 5);
    }

    #[test]
    fn test_segment_len_formula() {
        let group = SourceGroup {
            id: 1,
            directory: PathBuf::from("/w"),
            total_duration_s: 60.0,
            max_fps: 60,
            source_indices: vec![0],
            temp: TempPlan::new(Path::new("/w"), 1, 1),
            cat_path: PathBuf::from("/w/in.mkv"),
            needs_concat: false,
        };
        assert_eq!(group.segment_len_s(), 16);

        let group = SourceGroup {
            total_duration_s: 3.0,
            ..group
        };
        assert_eq!(group.segment_len_s(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_output_extension() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mkv");
        std::fs::File::create(&input)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let request = PlanRequest {
            inputs: vec![input],
            output: dir.path().join("out.mp4"),
            temp_dir: None,
            split_voice: false,
            force_upgrade: false,
            user_max_fps: None,
            user_target_fps: None,
            keep_temporaries: false,
        };
        let err = validate_request(&request).unwrap_err();
        assert!(err.to_string().contains(".mkv"));
    }

    #[test]
    fn test_validate_rejects_existing_output_and_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mkv");
        std::fs::File::create(&input)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        let output = dir.path().join("out.mkv");
        std::fs::File::create(&output).unwrap();

        let request = PlanRequest {
            inputs: vec![input.clone()],
            output,
            temp_dir: None,
            split_voice: false,
            force_upgrade: false,
            user_max_fps: None,
            user_target_fps: None,
            keep_temporaries: false,
        };
        assert!(validate_request(&request)
            .unwrap_err()
            .to_string()
            .contains("already exists"));

        let empty = dir.path().join("empty.mkv");
        std::fs::File::create(&empty).unwrap();
        let request = PlanRequest {
            inputs: vec![empty],
            output: dir.path().join("out2.mkv"),
            temp_dir: None,
            split_voice: false,
            force_upgrade: false,
            user_max_fps: None,
            user_target_fps: None,
            keep_temporaries: false,
        };
        assert!(validate_request(&request)
            .unwrap_err()
            .to_string()
            .contains("empty"));
    }

    #[test]
    fn test_validate_rejects_input_equals_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same.mkv");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        // output existing also trips, but identity must be reported first
        let request = PlanRequest {
            inputs: vec![path.clone()],
            output: path,
            temp_dir: None,
            split_voice: false,
            force_upgrade: false,
            user_max_fps: None,
            user_target_fps: None,
            keep_temporaries: false,
        };
        assert!(validate_request(&request)
            .unwrap_err()
            .to_string()
            .contains("same file"));
    }
}
