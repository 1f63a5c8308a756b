//! Target and maximum frame-rate selection

use serde::Serialize;

/// Threshold above which a recording is treated as high-framerate
const UPGRADE_THRESHOLD_FPS: u32 = 50;
/// Default target for high-framerate material
const TARGET_HIGH: u32 = 60;
/// Default target for everything else
const TARGET_LOW: u32 = 30;

/// The job-wide frame-rate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FpsPolicy {
    /// Final output rate (down-pass and assemble)
    pub target_fps: u32,
    /// Intermediate rate the up-pass raises to
    pub max_fps: u32,
}

impl FpsPolicy {
    /// Decide target and max fps from the probed maximum source rate and
    /// the user's flags
    ///
    /// Target defaults to 60 when the fastest source reaches 50 fps or the
    /// upgrade flag is set, 30 otherwise. Max defaults to twice the target
    /// but never drops below the fastest source. `--maxfps` can only raise
    /// the max; `--targetfps` overrides the target but is clamped to the
    /// max. Override values below 1 are ignored.
    pub fn determine(
        source_max_fps: u32,
        force_upgrade: bool,
        user_max_fps: Option<u32>,
        user_target_fps: Option<u32>,
    ) -> Self {
        let mut target = if source_max_fps >= UPGRADE_THRESHOLD_FPS || force_upgrade {
            TARGET_HIGH
        } else {
            TARGET_LOW
        };

        let mut max = (2 * target).max(source_max_fps);

        if let Some(user_max) = user_max_fps.filter(|v| *v >= 1) {
            max = max.max(user_max);
        }
        if let Some(user_target) = user_target_fps.filter(|v| *v >= 1) {
            target = user_target.min(max);
        }

        Self {
            target_fps: target,
            max_fps: max,
        }
    }
}
