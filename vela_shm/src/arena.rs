//! Offset arena over the extension region.
//!
//! The first `u64` of the extension region is the wasted-bytes tally;
//! everything past it is the arena. All stored offsets are
//! region-base-relative and 0 denotes "absent". Allocation is
//! append-only at the logical tail; freed entries only grow the wasted
//! tally, and defragmentation is the sole reclaimer.
//!
//! Bulk operations precompute their exact byte need, call
//! [`ExtShm::ensure`] once, then append. At every API boundary the
//! logical tail equals the mapping size, which keeps the accounting
//! invariant `wasted + live + header == size` checkable.

use std::path::Path;

use vela::consts::SHM_ALIGN;

use crate::error::{ShmError, ShmResult};
use crate::layout::OffLen;
use crate::shm_file::ShmFile;

/// Size of the wasted-bytes header at offset 0.
pub const ARENA_HDR: u64 = std::mem::size_of::<u64>() as u64;

/// Aligned allocation size for a raw byte length.
#[inline]
pub const fn shm_size(len: u64) -> u64 {
    (len + SHM_ALIGN - 1) & !(SHM_ALIGN - 1)
}

/// Aligned allocation size of an array of `count` elements of `T`.
#[inline]
pub const fn arr_size<T>(count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        shm_size(count * std::mem::size_of::<T>() as u64)
    }
}

/// Aligned allocation size of a NUL-terminated string.
#[inline]
pub fn str_size(s: &str) -> u64 {
    shm_size(s.len() as u64 + 1)
}

/// The extension region: wasted-bytes header plus offset arena.
pub struct ExtShm {
    file: ShmFile,
    cursor: u64,
}

impl ExtShm {
    /// Open or create the extension region.
    ///
    /// On create the region is one zeroed `u64` (zero wasted bytes).
    pub fn open(path: &Path, create: bool, mode: u32) -> ShmResult<(Self, bool)> {
        let (file, created) = ShmFile::open(path, create, mode, ARENA_HDR)?;
        let cursor = file.size();
        Ok((Self { file, cursor }, created))
    }

    /// Current region size; equals the logical tail between operations.
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Logical allocation tail.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// The raw region bytes; diagnostic use only.
    pub fn bytes(&self) -> &[u8] {
        self.file.as_slice()
    }

    /// The wasted-bytes tally.
    pub fn wasted(&self) -> u64 {
        self.get::<u64>(0)
    }

    /// Add freed bytes to the wasted tally.
    pub fn add_wasted(&mut self, bytes: u64) {
        let wasted = self.wasted() + bytes;
        self.set::<u64>(0, wasted);
    }

    /// Grow the mapping so `additional` more bytes can be appended.
    ///
    /// Callers compute `additional` with [`shm_size`]/[`arr_size`]/
    /// [`str_size`] so the post-operation tail lands exactly on the new
    /// mapping size.
    pub fn ensure(&mut self, additional: u64) -> ShmResult<()> {
        if additional == 0 {
            return Ok(());
        }
        self.file.remap(self.cursor + additional).map_err(|e| match e {
            ShmError::Io { source } => ShmError::Nomem {
                what: format!("arena remap: {source}"),
            },
            other => other,
        })
    }

    /// Swap in a compacted image (defragmentation only).
    pub(crate) fn replace(&mut self, image: &[u8]) -> ShmResult<()> {
        self.file.remap(image.len() as u64)?;
        self.file.as_mut_slice().copy_from_slice(image);
        self.cursor = image.len() as u64;
        Ok(())
    }

    /// Reserve `len` bytes at the tail, returning their offset.
    ///
    /// The tail advances by the aligned size. Capacity must have been
    /// arranged with [`ExtShm::ensure`].
    pub fn alloc(&mut self, len: u64) -> u64 {
        let off = self.cursor;
        self.cursor += shm_size(len);
        debug_assert!(self.cursor <= self.size(), "arena alloc past mapping");
        off
    }

    /// Copy raw bytes into the arena, returning their offset.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> u64 {
        let off = self.alloc(bytes.len() as u64);
        let dst = &mut self.file.as_mut_slice()[off as usize..off as usize + bytes.len()];
        dst.copy_from_slice(bytes);
        off
    }

    /// Copy a string and its NUL terminator, returning its offset.
    pub fn put_string(&mut self, s: &str) -> u64 {
        let off = self.alloc(s.len() as u64 + 1);
        let base = off as usize;
        let dst = self.file.as_mut_slice();
        dst[base..base + s.len()].copy_from_slice(s.as_bytes());
        dst[base + s.len()] = 0;
        off
    }

    /// Copy one plain record into the arena, returning its offset.
    pub fn put_val<T: Copy>(&mut self, val: &T) -> u64 {
        let bytes = unsafe {
            std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.put_bytes(bytes)
    }

    /// Copy an array of plain records, returning its offset (0 if empty).
    pub fn put_slice<T: Copy>(&mut self, vals: &[T]) -> u64 {
        if vals.is_empty() {
            return 0;
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                vals.as_ptr() as *const u8,
                std::mem::size_of_val(vals),
            )
        };
        self.put_bytes(bytes)
    }

    /// The bytes of a NUL-terminated string at `offset`, terminator
    /// excluded. Bounded scan; empty if the offset is out of range.
    pub fn cstr_at(&self, offset: u64) -> &[u8] {
        let data = self.file.as_slice();
        if offset == 0 || offset as usize >= data.len() {
            return &[];
        }
        let tail = &data[offset as usize..];
        match tail.iter().position(|&b| b == 0) {
            Some(nul) => &tail[..nul],
            None => tail,
        }
    }

    /// The string at `offset`.
    pub fn str_at(&self, offset: u64) -> ShmResult<&str> {
        std::str::from_utf8(self.cstr_at(offset)).map_err(|_| ShmError::Internal {
            reason: format!("non-UTF-8 string at arena offset {offset:#x}"),
        })
    }

    /// Length of the string at `offset`, terminator included.
    pub fn strlen_at(&self, offset: u64) -> u64 {
        self.cstr_at(offset).len() as u64 + 1
    }

    /// Aligned entry size of the string stored at `offset` (0 for 0).
    pub fn str_entry_size(&self, offset: u64) -> u64 {
        if offset == 0 {
            0
        } else {
            shm_size(self.strlen_at(offset))
        }
    }

    /// Read one plain record at `offset`.
    ///
    /// Callers guarantee the offset points at a live entry inside the
    /// mapping (registry invariant); violations are caught by the debug
    /// assertion.
    pub fn get<T: Copy>(&self, offset: u64) -> T {
        let end = offset as usize + std::mem::size_of::<T>();
        debug_assert!(end <= self.file.as_slice().len(), "arena read past mapping");
        unsafe {
            (self.file.as_slice().as_ptr().add(offset as usize) as *const T).read_unaligned()
        }
    }

    /// Write one plain record at `offset`.
    pub fn set<T: Copy>(&mut self, offset: u64, val: T) {
        let end = offset as usize + std::mem::size_of::<T>();
        debug_assert!(end <= self.file.as_slice().len(), "arena write past mapping");
        unsafe {
            (self.file.as_mut_slice().as_mut_ptr().add(offset as usize) as *mut T)
                .write_unaligned(val)
        }
    }

    /// Append `item` to a growable array, relocating it to the tail.
    ///
    /// The old array bytes are added to the wasted tally. Capacity for
    /// `arr_size::<T>(count + 1)` must have been arranged with
    /// [`ExtShm::ensure`]. Returns the new array descriptor.
    pub(crate) fn push_entry<T: Copy>(&mut self, arr: OffLen, item: T) -> OffLen {
        let elem = std::mem::size_of::<T>() as u64;
        let new_off = self.alloc((arr.count + 1) * elem);
        if arr.count > 0 {
            let src = arr.off as usize;
            let len = (arr.count * elem) as usize;
            let dst = new_off as usize;
            self.file.as_mut_slice().copy_within(src..src + len, dst);
            self.add_wasted(arr_size::<T>(arr.count));
        }
        self.set::<T>(new_off + arr.count * elem, item);
        OffLen {
            off: new_off,
            count: arr.count + 1,
        }
    }

    /// Swap the last element into slot `idx` and shrink the array.
    ///
    /// The freed tail bytes are added to the wasted tally; a now-empty
    /// array descriptor resets to absent. Iteration order is not
    /// preserved, only set membership.
    pub(crate) fn swap_remove_entry<T: Copy>(&mut self, arr: OffLen, idx: u64) -> OffLen {
        debug_assert!(idx < arr.count);
        let elem = std::mem::size_of::<T>() as u64;
        let last = arr.count - 1;
        if idx != last {
            let last_val: T = self.get(arr.off + last * elem);
            self.set(arr.off + idx * elem, last_val);
        }
        self.add_wasted(arr_size::<T>(arr.count) - arr_size::<T>(last));
        if last == 0 {
            OffLen::default()
        } else {
            OffLen {
                off: arr.off,
                count: last,
            }
        }
    }

    /// Account a freed string into the wasted tally.
    pub(crate) fn free_str(&mut self, offset: u64) {
        let bytes = self.str_entry_size(offset);
        if bytes > 0 {
            self.add_wasted(bytes);
        }
    }

    /// Account a freed array into the wasted tally.
    pub(crate) fn free_arr<T>(&mut self, arr: OffLen) {
        let bytes = arr_size::<T>(arr.count);
        if arr.off != 0 && bytes > 0 {
            self.add_wasted(bytes);
        }
    }

    /// Borrow an array of plain records.
    ///
    /// All allocations are 8-byte aligned and no stored record requires
    /// more, so the cast is always aligned.
    pub fn slice_at<T: Copy>(&self, offset: u64, count: u64) -> &[T] {
        if offset == 0 || count == 0 {
            return &[];
        }
        let bytes = count as usize * std::mem::size_of::<T>();
        debug_assert!(offset as usize + bytes <= self.file.as_slice().len());
        debug_assert_eq!(offset % SHM_ALIGN, 0);
        unsafe {
            std::slice::from_raw_parts(
                self.file.as_slice().as_ptr().add(offset as usize) as *const T,
                count as usize,
            )
        }
    }
}
