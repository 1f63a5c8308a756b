//! Free-space queries for working directories

use std::ffi::CString;
use std::path::Path;

use crate::error::{SmoothXError, SmoothXResult};

/// Bytes available to unprivileged writers in the filesystem holding `dir`
pub fn available_space(dir: &Path) -> SmoothXResult<u64> {
    let c_path = CString::new(dir.as_os_str().as_encoded_bytes()).map_err(|_| {
        SmoothXError::Usage {
            message: format!("Path contains NUL byte: {}", dir.display()),
        }
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(SmoothXError::Io(std::io::Error::last_os_error()));
    }

    // f_bavail counts blocks available to non-root; f_frsize is the
    // fragment size the counts are expressed in.
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}
