//! Error handling module for SmoothX

use thiserror::Error;

/// Main error type for SmoothX operations
#[derive(Error, Debug)]
pub enum SmoothXError {
    /// Bad command line or invalid job description
    #[error("Usage error: {message}")]
    Usage { message: String },

    /// A required external tool is not on PATH
    #[error("External tool not found: {tool}")]
    ToolMissing { tool: String },

    /// Probing an input failed or produced an unusable stream layout
    #[error("Probe failed for {path}: {message}")]
    Probe { path: String, message: String },

    /// Sources could not be partitioned into groups
    #[error("Source grouping failed: {message}")]
    Grouping { message: String },

    /// Not enough free space in a working directory
    #[error("Insufficient space in {directory}: need {needed} bytes, {available} available")]
    Space {
        directory: String,
        needed: u64,
        available: u64,
    },

    /// A pipeline stage ended with a failing worker
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: StageKind, message: String },

    /// A worker died in a way the watchdog could not recover from
    #[error("Worker crash: {message}")]
    WorkerCrash { message: String },

    /// The user asked us to stop
    #[error("Terminated on user request")]
    Terminated,

    /// An internal invariant was violated
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StageKind {
    Probe,
    Concat,
    Segment,
    InterpUp,
    InterpDown,
    WriteList,
    Assemble,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Probe => "probe",
            StageKind::Concat => "concat",
            StageKind::Segment => "segment",
            StageKind::InterpUp => "interp-up",
            StageKind::InterpDown => "interp-down",
            StageKind::WriteList => "write-list",
            StageKind::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

impl StageKind {
    /// Process exit code reported when this stage fails
    pub fn exit_code(&self) -> i32 {
        match self {
            StageKind::Probe => 6,
            StageKind::Concat => 7,
            StageKind::Segment => 8,
            StageKind::InterpUp => 9,
            StageKind::InterpDown => 10,
            StageKind::WriteList => 11,
            StageKind::Assemble => 12,
        }
    }
}

impl SmoothXError {
    /// Map this error to the documented process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            SmoothXError::Usage { .. } => 2,
            SmoothXError::ToolMissing { .. } => 3,
            SmoothXError::Probe { .. } => 6,
            SmoothXError::Grouping { .. } => 7,
            SmoothXError::Space { .. } => 2,
            SmoothXError::Stage { stage, .. } => stage.exit_code(),
            SmoothXError::WorkerCrash { .. } => 23,
            SmoothXError::Terminated => 42,
            SmoothXError::Internal { .. } => 42,
            SmoothXError::Io(_) => 1,
        }
    }
}

/// Result type alias for SmoothX operations
pub type SmoothXResult<T> = std::result::Result<T, SmoothXError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_exit_codes_are_contiguous() {
        assert_eq!(StageKind::Probe.exit_code(), 6);
        assert_eq!(StageKind::Concat.exit_code(), 7);
        assert_eq!(StageKind::Segment.exit_code(), 8);
        assert_eq!(StageKind::InterpUp.exit_code(), 9);
        assert_eq!(StageKind::InterpDown.exit_code(), 10);
        assert_eq!(StageKind::WriteList.exit_code(), 11);
        assert_eq!(StageKind::Assemble.exit_code(), 12);
    }

    #[test]
    fn test_error_exit_codes() {
        let err = SmoothXError::Usage {
            message: "bad".to_string(),
        };
        assert_eq!(err.exit_code(), 2);

        let err = SmoothXError::ToolMissing {
            tool: "ffmpeg".to_string(),
        };
        assert_eq!(err.exit_code(), 3);

        let err = SmoothXError::Stage {
            stage: StageKind::InterpDown,
            message: "worker 3 exited 1".to_string(),
        };
        assert_eq!(err.exit_code(), 10);

        assert_eq!(SmoothXError::Terminated.exit_code(), 42);
        let err = SmoothXError::WorkerCrash {
            message: "pid 1234 vanished".to_string(),
        };
        assert_eq!(err.exit_code(), 23);
    }
}
