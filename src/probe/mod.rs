//! Source probing module
//!
//! Wraps the external probe tool and turns its flat key=value output into
//! the immutable [`Source`] description the planner consumes.

use std::path::PathBuf;

use serde::Serialize;

pub mod inspector;

pub use inspector::SourceInspector;

/// Kind of a probed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamKind {
    Video,
    Audio,
    /// Subtitles, data, attachments; carried but never mapped
    Other,
}

/// One stream of a probed input
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    /// Stream index as reported by the probe tool
    pub index: usize,
    pub kind: StreamKind,
    pub codec_name: String,
    /// Channel count; 0 for non-audio streams
    pub channels: u32,
}

/// An input video with its probe-derived attributes
///
/// Created once during planning and immutable thereafter.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub path: PathBuf,
    /// Directory holding the input (segment artifacts land here unless a
    /// global temp dir was given)
    pub directory: PathBuf,
    pub duration_s: f64,
    /// Average frame rate, floored to a whole number
    pub avg_fps: u32,
    pub bitrate_bps: u64,
    pub streams: Vec<StreamInfo>,
    /// Index into `streams` of the first video stream
    pub video_stream: usize,
    /// Indices into `streams` of the audio streams, main first, at most two
    pub audio_streams: Vec<usize>,
}

impl Source {
    /// Channel count of the main audio stream, 0 when there is none
    pub fn main_audio_channels(&self) -> u32 {
        self.audio_streams
            .first()
            .map(|&i| self.streams[i].channels)
            .unwrap_or(0)
    }

    /// True when a secondary (voice) audio stream was probed
    pub fn has_voice_stream(&self) -> bool {
        self.audio_streams.len() > 1
    }

    /// Codec names in stream-index order, the grouping key component
    pub fn codec_layout(&self) -> Vec<&str> {
        self.streams.iter().map(|s| s.codec_name.as_str()).collect()
    }
}
