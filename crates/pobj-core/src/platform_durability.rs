//! Platform-specific durable sync for pool files
//!
//! A pool is written through a shared mapping, so `msync` (via memmap2) gets
//! dirty pages into the file. That alone does not guarantee the file's data
//! or a newly created directory entry survives power loss; the helpers here
//! issue the strongest flush each platform offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures file data is durably written to persistent storage before returning.
///
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC), plain fsync only reaches the drive cache
/// - Windows: FlushFileBuffers()
/// - Other: File::sync_data()
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fdatasync only reads the descriptor; it stays open for the
        // lifetime of the borrowed File.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: F_FULLFSYNC takes no pointer arguments and the descriptor
        // stays open for the lifetime of the borrowed File.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle belongs to the borrowed File and is valid here.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist the directory entry of a freshly created file.
///
/// Without this a crash right after pool creation can leave a fully written
/// pool that no directory points to. A no-op on Windows, where directories
/// cannot be opened as files.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let dir = File::open(parent)?;
        dir.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
