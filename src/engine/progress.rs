//! Progress-file protocol
//!
//! The encoder appends blocks of `key=value` lines to its progress file,
//! each block terminated by `progress=continue` (or `progress=end`). The
//! file grows while we read it, so the parser tails the last few kilobytes
//! and must tolerate a partial trailing line.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// How much of the file tail to inspect; generously covers ~20 lines
const TAIL_BYTES: u64 = 4096;
/// Lines considered from the tail
const TAIL_LINES: usize = 20;

/// State of the most recent progress block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressState {
    /// No complete block seen yet (or no file at all)
    #[default]
    None,
    Continue,
    Ended,
}

/// One decoded progress block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressFrame {
    pub bitrate_bps: u64,
    pub dup_frames: u64,
    pub drop_frames: u64,
    pub fps: f64,
    pub frame: u64,
    pub out_time_us: i64,
    pub total_size: u64,
    pub state: ProgressState,
}

impl ProgressFrame {
    /// Fold another worker's frame into a stage-wide aggregate
    pub fn absorb(&mut self, other: &ProgressFrame) {
        self.bitrate_bps += other.bitrate_bps;
        self.dup_frames += other.dup_frames;
        self.drop_frames += other.drop_frames;
        self.fps += other.fps;
        self.frame += other.frame;
        self.out_time_us = self.out_time_us.max(other.out_time_us);
        self.total_size += other.total_size;
    }

    /// Dropped-plus-duplicated frame count, the assemble filter input
    pub fn dropdups(&self) -> u64 {
        self.dup_frames + self.drop_frames
    }
}

/// Read the newest complete progress block from a file
///
/// Returns a default (state None) frame when the file is missing, empty,
/// or holds no complete `progress=` line yet.
pub fn read_latest(path: &Path) -> ProgressFrame {
    let Ok(mut file) = std::fs::File::open(path) else {
        return ProgressFrame::default();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(TAIL_BYTES);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return ProgressFrame::default();
    }

    let mut tail = String::new();
    if file.read_to_string(&mut tail).is_err() {
        return ProgressFrame::default();
    }

    let mut lines: Vec<&str> = tail.lines().collect();
    // a mid-file seek may have landed inside a line; drop the fragment
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    // the file may end in a partially written line; drop that too
    if !tail.ends_with('\n') {
        lines.pop();
    }
    if lines.len() > TAIL_LINES {
        lines.drain(..lines.len() - TAIL_LINES);
    }

    parse_tail(&lines)
}

/// Decode the newest block from already-split tail lines, newest last
fn parse_tail(lines: &[&str]) -> ProgressFrame {
    let mut frame = ProgressFrame::default();

    // newest progress= marker decides the state
    let Some(marker) = lines
        .iter()
        .rposition(|line| line.starts_with("progress="))
    else {
        return frame;
    };

    frame.state = match lines[marker].trim_end() {
        "progress=end" => ProgressState::Ended,
        _ => ProgressState::Continue,
    };

    // walk back through the block the marker terminates, stopping at the
    // previous block's marker
    for line in lines[..marker].iter().rev() {
        if line.starts_with("progress=") {
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key {
            "bitrate" => frame.bitrate_bps = parse_bitrate(value),
            "dup_frames" => frame.dup_frames = value.parse().unwrap_or(0),
            "drop_frames" => frame.drop_frames = value.parse().unwrap_or(0),
            "fps" => frame.fps = value.parse().unwrap_or(0.0),
            "frame" => frame.frame = value.parse().unwrap_or(0),
            // out_time_ms is in microseconds despite the name
            "out_time_ms" => frame.out_time_us = value.parse().unwrap_or(0),
            "total_size" => frame.total_size = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    frame
}

/// `bitrate= 870.9kbits/s` → bits/s; `N/A` → 0
fn parse_bitrate(value: &str) -> u64 {
    let digits: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let kbits: f64 = digits.parse().unwrap_or(0.0);
    (kbits * 1000.0) as u64
}
