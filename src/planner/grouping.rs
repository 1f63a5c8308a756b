//! Partitioning sources into groups
//!
//! A group is a maximal contiguous run of sources that concat can join
//! without re-encoding: same stream count, same codec per stream index,
//! same channel count on the main audio stream, and, when temporaries land
//! next to the inputs, the same directory.

use std::path::Path;

use crate::error::{SmoothXError, SmoothXResult};
use crate::probe::Source;

/// Indices of the sources forming one group, in input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpan {
    pub source_indices: Vec<usize>,
}

/// Split sources into contiguous compatible runs
///
/// `shared_temp` is true when a global temp dir was given, which removes
/// the directory component from the grouping key.
pub fn partition(sources: &[Source], shared_temp: bool) -> SmoothXResult<Vec<GroupSpan>> {
    if sources.is_empty() {
        return Err(SmoothXError::Grouping {
            message: "no sources to group".to_string(),
        });
    }

    let mut spans: Vec<GroupSpan> = Vec::new();
    let mut current = GroupSpan {
        source_indices: vec![0],
    };

    for (index, source) in sources.iter().enumerate().skip(1) {
        let prev = &sources[index - 1];
        if compatible(prev, source, shared_temp) {
            current.source_indices.push(index);
        } else {
            spans.push(std::mem::replace(
                &mut current,
                GroupSpan {
                    source_indices: vec![index],
                },
            ));
        }
    }
    spans.push(current);

    Ok(spans)
}

fn compatible(a: &Source, b: &Source, shared_temp: bool) -> bool {
    if !shared_temp && !same_dir(&a.directory, &b.directory) {
        return false;
    }
    if a.streams.len() != b.streams.len() {
        return false;
    }
    if a.main_audio_channels() != b.main_audio_channels() {
        return false;
    }
    // codec name compared per stream index
    a.codec_layout() == b.codec_layout()
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{StreamInfo, StreamKind};
    use std::path::PathBuf;

    fn source(dir: &str, codecs: &[&str], channels: u32) -> Source {
        let streams: Vec<StreamInfo> = codecs
            .iter()
            .enumerate()
            .map(|(i, codec)| StreamInfo {
                index: i,
                kind: if i == 0 {
                    StreamKind::Video
                } else {
                    StreamKind::Audio
                },
                codec_name: codec.to_string(),
                channels: if i == 0 { 0 } else { channels },
            })
            .collect();
        let audio_streams = (1..codecs.len()).collect();
        Source {
            path: PathBuf::from(dir).join("in.mkv"),
            directory: PathBuf::from(dir),
            duration_s: 60.0,
            avg_fps: 60,
            bitrate_bps: 48_000_000,
            streams,
            video_stream: 0,
            audio_streams,
        }
    }

    #[test]
    fn test_identical_sources_form_one_group() {
        let sources = vec![
            source("/rec", &["h264", "aac"], 2),
            source("/rec", &["h264", "aac"], 2),
            source("/rec", &["h264", "aac"], 2),
        ];
        let spans = partition(&sources, false).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].source_indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_codec_change_splits() {
        let sources = vec![
            source("/rec", &["h264", "aac"], 2),
            source("/rec", &["hevc", "aac"], 2),
        ];
        let spans = partition(&sources, false).unwrap();
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_directory_change_splits_without_shared_temp() {
        let sources = vec![
            source("/a", &["h264", "aac"], 2),
            source("/b", &["h264", "aac"], 2),
        ];
        assert_eq!(partition(&sources, false).unwrap().len(), 2);
        // a shared temp dir removes the directory from the key
        assert_eq!(partition(&sources, true).unwrap().len(), 1);
    }

    #[test]
    fn test_channel_count_splits() {
        let sources = vec![
            source("/rec", &["h264", "aac"], 2),
            source("/rec", &["h264", "aac"], 6),
        ];
        assert_eq!(partition(&sources, false).unwrap().len(), 2);
    }

    #[test]
    fn test_grouping_is_contiguous_not_global() {
        // an incompatible source in the middle yields three groups even
        // though the outer two match each other
        let sources = vec![
            source("/rec", &["h264", "aac"], 2),
            source("/rec", &["hevc", "aac"], 2),
            source("/rec", &["h264", "aac"], 2),
        ];
        assert_eq!(partition(&sources, false).unwrap().len(), 3);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(partition(&[], false).is_err());
    }
}
