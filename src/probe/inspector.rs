//! Probe tool invocation and flat-output parsing

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{SmoothXError, SmoothXResult};
use crate::probe::{Source, StreamInfo, StreamKind};

/// Upper bound for the second probe's `-probesize`
const PROBE_SIZE_CAP: u64 = 256 * 1024 * 1024;
/// Upper bound for the second probe's `-analyzeduration`, in seconds
const ANALYZE_DURATION_CAP_S: f64 = 30.0;
/// Upper bound for the second probe's `-fpsprobesize`
const FPS_PROBE_CAP: u64 = 8 * 120;

/// Source inspector driving the external probe tool
pub struct SourceInspector {
    ffprobe: PathBuf,
}

/// Parsed view of one flat probe run
#[derive(Debug, Default)]
struct FlatProbe {
    format: BTreeMap<String, String>,
    streams: BTreeMap<usize, BTreeMap<String, String>>,
}

impl SourceInspector {
    pub fn new(ffprobe: PathBuf) -> Self {
        Self { ffprobe }
    }

    /// Probe an input twice and build its [`Source`] description
    ///
    /// The first run uses the tool's default probe limits to learn duration
    /// and average fps; the second run re-probes with bounds derived from
    /// the first result so oversized heads of high-bitrate recordings do
    /// not starve the analysis.
    pub fn inspect(&self, path: &Path) -> SmoothXResult<Source> {
        debug!("probing {}", path.display());
        let first = self.run_probe(path, None)?;
        let duration = first.duration(path)?;
        let bitrate = first.bitrate();

        let bounds = ProbeBounds::derive(duration, bitrate);
        let flat = self.run_probe(path, Some(&bounds))?;

        build_source(path, &flat)
    }

    fn run_probe(&self, path: &Path, bounds: Option<&ProbeBounds>) -> SmoothXResult<FlatProbe> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.arg("-hide_banner").arg("-loglevel").arg("level+warning");
        if let Some(b) = bounds {
            cmd.arg("-probesize").arg(b.probe_size.to_string());
            cmd.arg("-analyzeduration").arg(b.analyze_duration_us.to_string());
            cmd.arg("-fpsprobesize").arg(b.fps_probe_size.to_string());
        }
        cmd.arg("-show_format")
            .arg("-show_streams")
            .arg("-of")
            .arg("flat=s=_")
            .arg(path);

        let output = cmd.output().map_err(|e| SmoothXError::Probe {
            path: path.display().to_string(),
            message: format!("failed to launch probe tool: {}", e),
        })?;

        if !output.status.success() {
            return Err(SmoothXError::Probe {
                path: path.display().to_string(),
                message: format!(
                    "probe tool exited {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(parse_flat(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Bounds for the second probe pass
#[derive(Debug, Clone, Copy)]
struct ProbeBounds {
    probe_size: u64,
    analyze_duration_us: u64,
    fps_probe_size: u64,
}

impl ProbeBounds {
    fn derive(duration_s: f64, bitrate_bps: u64) -> Self {
        let window_s = duration_s.min(ANALYZE_DURATION_CAP_S).max(1.0);
        let probe_size = ((bitrate_bps / 8) as f64 * window_s) as u64;
        Self {
            probe_size: probe_size.clamp(1, PROBE_SIZE_CAP),
            analyze_duration_us: (window_s * 1_000_000.0) as u64,
            fps_probe_size: FPS_PROBE_CAP,
        }
    }
}

impl FlatProbe {
    fn duration(&self, path: &Path) -> SmoothXResult<f64> {
        self.format
            .get("duration")
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0)
            .ok_or_else(|| SmoothXError::Probe {
                path: path.display().to_string(),
                message: "unparseable container duration".to_string(),
            })
    }

    fn bitrate(&self) -> u64 {
        self.format
            .get("bit_rate")
            .and_then(|b| b.parse().ok())
            .unwrap_or(0)
    }
}

/// Parse `format_<k>=v` and `streams_stream_<n>_<k>=v` lines
///
/// Values may or may not be double-quoted depending on the field type.
fn parse_flat(text: &str) -> FlatProbe {
    let mut probe = FlatProbe::default();

    for line in text.lines() {
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let value = raw_value.trim().trim_matches('"').to_string();

        if let Some(field) = key.strip_prefix("format_") {
            probe.format.insert(field.to_string(), value);
        } else if let Some(rest) = key.strip_prefix("streams_stream_") {
            let Some((idx_str, field)) = rest.split_once('_') else {
                continue;
            };
            let Ok(index) = idx_str.parse::<usize>() else {
                continue;
            };
            probe
                .streams
                .entry(index)
                .or_default()
                .insert(field.to_string(), value);
        }
    }

    probe
}

/// Interpret `avg_frame_rate` as a whole fps, flooring fractions
///
/// `48000/1001` floors to 47; a bare integer passes through; `0/0` and
/// other malformed rates collapse to 0.
fn parse_avg_fps(rate: &str) -> u32 {
    if let Some((num, den)) = rate.split_once('/') {
        let num: f64 = num.parse().unwrap_or(0.0);
        let den: f64 = den.parse().unwrap_or(0.0);
        if den <= 0.0 {
            return 0;
        }
        return (num / den).floor() as u32;
    }
    rate.parse::<f64>().map(|v| v.floor() as u32).unwrap_or(0)
}

fn build_source(path: &Path, flat: &FlatProbe) -> SmoothXResult<Source> {
    let probe_err = |message: String| SmoothXError::Probe {
        path: path.display().to_string(),
        message,
    };

    let duration_s = flat.duration(path)?;
    let bitrate_bps = flat.bitrate();

    let mut streams = Vec::new();
    let mut video_stream = None;
    let mut audio_streams = Vec::new();
    let mut avg_fps = 0u32;

    for (&index, fields) in &flat.streams {
        let codec_type = fields.get("codec_type").map(String::as_str).unwrap_or("");
        let kind = match codec_type {
            "video" => StreamKind::Video,
            "audio" => StreamKind::Audio,
            _ => StreamKind::Other,
        };

        if kind == StreamKind::Video && video_stream.is_none() {
            video_stream = Some(streams.len());
            avg_fps = fields
                .get("avg_frame_rate")
                .map(|r| parse_avg_fps(r))
                .unwrap_or(0);
        }
        if kind == StreamKind::Audio {
            audio_streams.push(streams.len());
        }

        streams.push(StreamInfo {
            index,
            kind,
            codec_name: fields
                .get("codec_name")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            channels: fields
                .get("channels")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
        });
    }

    let video_stream =
        video_stream.ok_or_else(|| probe_err("no video stream present".to_string()))?;
    if audio_streams.len() > 2 {
        return Err(probe_err(format!(
            "{} audio streams present, at most 2 (main + voice) are supported",
            audio_streams.len()
        )));
    }
    if avg_fps == 0 {
        return Err(probe_err("unparseable average frame rate".to_string()));
    }

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(Source {
        path: path.to_path_buf(),
        directory,
        duration_s,
        avg_fps,
        bitrate_bps,
        streams,
        video_stream,
        audio_streams,
    })
}
