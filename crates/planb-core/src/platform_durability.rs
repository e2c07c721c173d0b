//! Platform-specific directory sync
//!
//! LMDB makes its own data file durable on commit. What it does not cover is
//! the directory entries PlanB creates and removes around it: a merged
//! source directory that was deleted must stay deleted after a crash. This
//! module flushes a directory's entries to persistent storage.

use std::fs::File;
use std::io;
use std::path::Path;

/// Durably record the current entries of directory `dir`.
///
/// Platform behaviors:
/// - Linux: fsync() on the directory descriptor
/// - macOS/iOS: fcntl(F_FULLFSYNC), since fsync() stops at the drive cache
/// - Other: no-op; directories cannot be opened for sync (e.g. Windows)
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let file = File::open(dir)?;
        // SAFETY: fsync operates on the descriptor of `file`, which is open
        // for the duration of the call.
        let result = unsafe { libc::fsync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let file = File::open(dir)?;
        // SAFETY: fcntl with F_FULLFSYNC on the descriptor of `file`, which
        // is open for the duration of the call.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(all(unix, not(any(target_os = "linux", target_os = "macos", target_os = "ios"))))]
    {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Remove directory `dir` and everything in it, then sync its parent so the
/// removal survives a crash.
pub fn remove_dir_durably(dir: &Path) -> io::Result<()> {
    std::fs::remove_dir_all(dir)?;
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}
