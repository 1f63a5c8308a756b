//! Working-space budget checks
//!
//! Interpolated intermediates are enormous compared to their sources; the
//! factor shrinks as source bitrate grows because high-bitrate recordings
//! are already close to the intermediate codec's size.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{SmoothXError, SmoothXResult};
use crate::probe::Source;
use crate::utils::disk;

/// Bitrate at or below which the full 100x factor applies, bits/s
const FACTOR_LOW_BPS: f64 = 45_000_000.0;
/// Bitrate at or above which the 20x floor applies, bits/s
const FACTOR_HIGH_BPS: f64 = 180_000_000.0;
const FACTOR_MAX: f64 = 100.0;
const FACTOR_MIN: f64 = 20.0;

/// Size multiplier for one source's working set, linear between the
/// 100x / 20x anchor points
pub fn size_factor(bitrate_bps: u64) -> f64 {
    let bps = bitrate_bps as f64;
    if bps <= FACTOR_LOW_BPS {
        return FACTOR_MAX;
    }
    if bps >= FACTOR_HIGH_BPS {
        return FACTOR_MIN;
    }
    let span = FACTOR_HIGH_BPS - FACTOR_LOW_BPS;
    FACTOR_MAX - (bps - FACTOR_LOW_BPS) / span * (FACTOR_MAX - FACTOR_MIN)
}

/// Verify every working directory can hold its share of temporaries
///
/// `temp_dir` overrides the per-source directory when given. Requirements
/// are summed per directory and compared against the filesystem's free
/// space.
pub fn check_budget(sources: &[Source], temp_dir: Option<&Path>) -> SmoothXResult<()> {
    let mut needed_by_dir: BTreeMap<PathBuf, u64> = BTreeMap::new();

    for source in sources {
        let dir = temp_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| source.directory.clone());
        let size = std::fs::metadata(&source.path)?.len();
        let need = (size as f64 * size_factor(source.bitrate_bps)) as u64;
        *needed_by_dir.entry(dir).or_insert(0) += need;
    }

    for (dir, needed) in needed_by_dir {
        let available = disk::available_space(&dir)?;
        debug!(
            "space budget for {}: need {} bytes, {} available",
            dir.display(),
            needed,
            available
        );
        if needed > available {
            return Err(SmoothXError::Space {
                directory: dir.display().to_string(),
                needed,
                available,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_factor_anchors() {
        assert_eq!(size_factor(45_000_000), 100.0);
        assert_eq!(size_factor(10_000_000), 100.0);
        assert_eq!(size_factor(180_000_000), 20.0);
        assert_eq!(size_factor(400_000_000), 20.0);
    }

    #[test]
    fn test_size_factor_midpoint() {
        // halfway between the anchors the factor is halfway too
        let mid = (45_000_000 + 180_000_000) / 2;
        assert!((size_factor(mid) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_size_factor_monotone_decreasing() {
        let mut last = f64::INFINITY;
        for bps in (40..200).map(|m| m * 1_000_000) {
            let f = size_factor(bps);
            assert!(f <= last);
            last = f;
        }
    }
}
