//! Memory-mapped file handles and process-liveness helpers.
//!
//! A [`ShmFile`] wraps one named backing file, its current mapping and
//! size. Remapping replaces the mapping wholesale; every interior
//! pointer derived from the old base is invalidated, which the borrow
//! checker enforces because all views borrow the handle.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;

use crate::error::{ShmError, ShmResult};

/// A typed handle over one memory-mapped shared file.
#[derive(Debug)]
pub struct ShmFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl ShmFile {
    /// Open or create a shared file and map it.
    ///
    /// On create the file is truncated to `initial_size` and zero-filled
    /// by the filesystem. Returns whether creation occurred so the
    /// creator can perform one-time header initialization. Callers
    /// serialize create/attach through the repo lock.
    pub fn open(
        path: &Path,
        create: bool,
        mode: u32,
        initial_size: u64,
    ) -> ShmResult<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .mode(mode)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ShmError::NotFound {
                        what: format!("shared file {}", path.display()),
                    }
                } else {
                    ShmError::Io { source: e }
                }
            })?;

        // A zero-length file means the creator died before sizing it;
        // treat it as freshly created.
        let len = file.metadata()?.len();
        let created = len == 0;
        if created {
            file.set_len(initial_size)?;
        }

        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                map,
            },
            created,
        ))
    }

    /// Replace the mapping with one of `new_size` bytes.
    ///
    /// The backing file is truncated to `new_size` (growing or, for the
    /// defragmentation swap, shrinking) and remapped. Existing content
    /// up to `min(old, new)` is preserved.
    pub fn remap(&mut self, new_size: u64) -> ShmResult<()> {
        if new_size == self.size() {
            return Ok(());
        }
        if new_size == 0 {
            return Err(ShmError::Internal {
                reason: format!("remap of {} to zero bytes", self.path.display()),
            });
        }
        self.file.set_len(new_size)?;
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }

    /// Current mapping size in bytes.
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole mapping as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// The whole mapping as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// Advisory whole-file write lock gating repository creation/attach.
///
/// Held for the duration of connection setup so that one-time header
/// initialization cannot race an attaching process. Released on drop.
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Create/open the lock file and take the exclusive flock.
    ///
    /// The blocking acquisition is restarted on `EINTR`.
    pub fn acquire(path: &Path, mode: u32) -> ShmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)?;

        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = nix::Error::last();
            if err == nix::Error::EINTR {
                continue;
            }
            return Err(ShmError::Sys {
                syscall: "flock",
                source: err,
            });
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Get current process ID
pub fn current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Use a null signal (None) to test for process existence without
    // sending a signal
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shm_test");

        let (file, created) = ShmFile::open(&path, true, 0o600, 64).unwrap();
        assert!(created);
        assert_eq!(file.size(), 64);
        drop(file);

        let (file, created) = ShmFile::open(&path, false, 0o600, 64).unwrap();
        assert!(!created);
        assert_eq!(file.size(), 64);
    }

    #[test]
    fn attach_missing_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let err = ShmFile::open(&path, false, 0o600, 64).unwrap_err();
        assert!(matches!(err, ShmError::NotFound { .. }));
    }

    #[test]
    fn remap_grows_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shm_grow");

        let (mut file, _) = ShmFile::open(&path, true, 0o600, 16).unwrap();
        file.as_mut_slice()[..4].copy_from_slice(b"vela");

        file.remap(4096).unwrap();
        assert_eq!(file.size(), 4096);
        assert_eq!(&file.as_slice()[..4], b"vela");

        // Shrink keeps the prefix.
        file.remap(8).unwrap();
        assert_eq!(file.size(), 8);
        assert_eq!(&file.as_slice()[..4], b"vela");
    }

    #[test]
    fn repo_lock_is_reentrant_per_file_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let first = RepoLock::acquire(&path, 0o600).unwrap();
        drop(first);
        // Re-acquirable after release.
        let _second = RepoLock::acquire(&path, 0o600).unwrap();
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(current_pid()));
    }
}
