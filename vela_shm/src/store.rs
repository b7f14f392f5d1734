//! The two-region store: main registry region + extension arena.
//!
//! [`MainShm`] types the fixed-layout main region (header plus a dense
//! module-record array reaching the tail). [`ShmStore`] owns both
//! regions; registry, connection-table, recovery and defragmentation
//! operations are implemented on it in their own modules.

use std::path::Path;

use vela::consts::{EXT_SHM_FILE, MAIN_SHM_FILE, VELA_SHM_MAGIC, VELA_SHM_VER};

use crate::arena::ExtShm;
use crate::error::{ShmError, ShmResult};
use crate::layout::{MainHeader, ModuleRecord};
use crate::shm_file::ShmFile;

/// Size of the main header in bytes.
pub const MAIN_HDR_SIZE: u64 = std::mem::size_of::<MainHeader>() as u64;

/// Size of one module record in bytes.
pub const MOD_REC_SIZE: u64 = std::mem::size_of::<ModuleRecord>() as u64;

/// Typed handle over the main region.
pub struct MainShm {
    file: ShmFile,
}

impl MainShm {
    /// Open or create the main region.
    ///
    /// On create the region is exactly one zeroed header; the caller
    /// performs the one-time header initialization under the repo lock.
    pub fn open(path: &Path, create: bool, mode: u32) -> ShmResult<(Self, bool)> {
        let (file, created) = ShmFile::open(path, create, mode, MAIN_HDR_SIZE)?;
        Ok((Self { file }, created))
    }

    /// The header at offset 0.
    pub fn header(&self) -> &MainHeader {
        unsafe { &*(self.file.as_slice().as_ptr() as *const MainHeader) }
    }

    /// Mutable header access for the plain (non-atomic) fields.
    pub fn header_mut(&mut self) -> &mut MainHeader {
        unsafe { &mut *(self.file.as_mut_slice().as_mut_ptr() as *mut MainHeader) }
    }

    /// Number of module records; derived from the region size.
    pub fn module_count(&self) -> usize {
        ((self.file.size() - MAIN_HDR_SIZE) / MOD_REC_SIZE) as usize
    }

    /// The module record at `idx`.
    pub fn module(&self, idx: usize) -> &ModuleRecord {
        debug_assert!(idx < self.module_count());
        unsafe {
            &*(self
                .file
                .as_slice()
                .as_ptr()
                .add((MAIN_HDR_SIZE + idx as u64 * MOD_REC_SIZE) as usize)
                as *const ModuleRecord)
        }
    }

    /// Mutable access to the module record at `idx`.
    pub fn module_mut(&mut self, idx: usize) -> &mut ModuleRecord {
        debug_assert!(idx < self.module_count());
        unsafe {
            &mut *(self
                .file
                .as_mut_slice()
                .as_mut_ptr()
                .add((MAIN_HDR_SIZE + idx as u64 * MOD_REC_SIZE) as usize)
                as *mut ModuleRecord)
        }
    }

    /// Grow the dense array by `add` zeroed records.
    pub fn grow_modules(&mut self, add: usize) -> ShmResult<()> {
        let new_size = self.file.size() + add as u64 * MOD_REC_SIZE;
        self.file.remap(new_size)
    }

    /// Remove the record at `idx`, keeping the array dense.
    ///
    /// The following records shift down one slot and the region shrinks
    /// by one record. Runs under the write lock only.
    pub fn remove_module_record(&mut self, idx: usize) -> ShmResult<()> {
        let count = self.module_count();
        debug_assert!(idx < count);
        let start = (MAIN_HDR_SIZE + (idx + 1) as u64 * MOD_REC_SIZE) as usize;
        let dst = (MAIN_HDR_SIZE + idx as u64 * MOD_REC_SIZE) as usize;
        let end = (MAIN_HDR_SIZE + count as u64 * MOD_REC_SIZE) as usize;
        self.file.as_mut_slice().copy_within(start..end, dst);
        self.file.remap(MAIN_HDR_SIZE + (count - 1) as u64 * MOD_REC_SIZE)
    }
}

/// Both shared regions of one repository.
pub struct ShmStore {
    pub(crate) main: MainShm,
    pub(crate) ext: ExtShm,
}

impl ShmStore {
    /// Open or create both regions under `repo_path`.
    ///
    /// Returns whether the regions were created; the caller must hold
    /// the repo lock across the call so one-time initialization cannot
    /// race an attach.
    pub fn open(repo_path: &Path, file_mode: u32) -> ShmResult<(Self, bool)> {
        let (mut main, created_main) =
            MainShm::open(&repo_path.join(MAIN_SHM_FILE), true, file_mode)?;
        let (ext, created_ext) = ExtShm::open(&repo_path.join(EXT_SHM_FILE), true, file_mode)?;

        if created_main != created_ext {
            return Err(ShmError::InitFailed {
                reason: format!(
                    "partial repository at {}: one region exists without the other",
                    repo_path.display()
                ),
            });
        }

        if created_main {
            unsafe {
                (main.file.as_mut_slice().as_mut_ptr() as *mut MainHeader)
                    .write(MainHeader::new(VELA_SHM_MAGIC, VELA_SHM_VER));
            }
        } else {
            let hdr = main.header();
            if hdr.magic != VELA_SHM_MAGIC {
                return Err(ShmError::InitFailed {
                    reason: format!("bad magic in {}", repo_path.display()),
                });
            }
            if hdr.shm_ver != VELA_SHM_VER {
                return Err(ShmError::InitFailed {
                    reason: format!(
                        "layout version mismatch: region has {}, expected {VELA_SHM_VER}",
                        hdr.shm_ver
                    ),
                });
            }
        }

        Ok((Self { main, ext }, created_main))
    }

    /// The main region.
    pub fn main(&self) -> &MainShm {
        &self.main
    }

    /// The extension arena.
    pub fn ext(&self) -> &ExtShm {
        &self.ext
    }

    /// Draw a new unique session id.
    pub fn next_session_id(&self) -> u32 {
        use std::sync::atomic::Ordering;
        self.main
            .header()
            .next_session_id
            .fetch_add(1, Ordering::SeqCst)
    }

    /// Draw a new unique event-pipe identifier.
    pub fn next_evpipe_id(&self) -> u32 {
        use std::sync::atomic::Ordering;
        self.main
            .header()
            .next_evpipe_id
            .fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_initializes_header() {
        let dir = tempfile::tempdir().unwrap();
        let (store, created) = ShmStore::open(dir.path(), 0o600).unwrap();
        assert!(created);
        let hdr = store.main().header();
        assert_eq!(hdr.magic, VELA_SHM_MAGIC);
        assert_eq!(hdr.shm_ver, VELA_SHM_VER);
        assert_eq!(store.main().module_count(), 0);
        assert_eq!(store.ext().wasted(), 0);
    }

    #[test]
    fn reattach_validates_header() {
        let dir = tempfile::tempdir().unwrap();
        let (store, created) = ShmStore::open(dir.path(), 0o600).unwrap();
        assert!(created);
        drop(store);

        let (store, created) = ShmStore::open(dir.path(), 0o600).unwrap();
        assert!(!created);
        assert_eq!(store.main().header().magic, VELA_SHM_MAGIC);
    }

    #[test]
    fn id_counters_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = ShmStore::open(dir.path(), 0o600).unwrap();
        let a = store.next_session_id();
        let b = store.next_session_id();
        let c = store.next_session_id();
        assert!(a < b && b < c);

        let p = store.next_evpipe_id();
        let q = store.next_evpipe_id();
        assert!(p < q);
    }

    #[test]
    fn grow_and_remove_keep_array_dense() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = ShmStore::open(dir.path(), 0o600).unwrap();
        store.main.grow_modules(3).unwrap();
        assert_eq!(store.main.module_count(), 3);
        store.main.module_mut(0).name = 100;
        store.main.module_mut(1).name = 200;
        store.main.module_mut(2).name = 300;

        store.main.remove_module_record(1).unwrap();
        assert_eq!(store.main.module_count(), 2);
        assert_eq!(store.main.module(0).name, 100);
        assert_eq!(store.main.module(1).name, 300);
    }
}
