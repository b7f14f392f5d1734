//! Arena-resident connection table.
//!
//! One [`ConnState`] record per attached process connection, holding
//! the owning PID, the event-pipe identifier list and the held-lock
//! bookkeeping consumed by crash recovery. The table relocates to the
//! arena tail on every append; removal swaps the last entry into the
//! hole.

use crate::arena::arr_size;
use crate::error::{ShmError, ShmResult};
use crate::layout::{ConnState, HeldLock, HeldLockKind};
use crate::store::ShmStore;

const CONN_SIZE: u64 = std::mem::size_of::<ConnState>() as u64;

impl ShmStore {
    /// Number of live connection records.
    pub fn conn_count(&self) -> usize {
        self.main.header().conns.count as usize
    }

    /// The connection record at `idx`.
    pub fn conn_state(&self, idx: usize) -> ConnState {
        let conns = self.main.header().conns;
        debug_assert!((idx as u64) < conns.count);
        self.ext.get::<ConnState>(conns.off + idx as u64 * CONN_SIZE)
    }

    fn write_conn_state(&mut self, idx: usize, state: ConnState) {
        let conns = self.main.header().conns;
        debug_assert!((idx as u64) < conns.count);
        self.ext.set(conns.off + idx as u64 * CONN_SIZE, state);
    }

    /// Linear scan for the `(conn handle, pid)` pair.
    pub fn conn_find(&self, conn: u64, pid: u32) -> Option<usize> {
        (0..self.conn_count())
            .find(|&idx| {
                let state = self.conn_state(idx);
                state.conn == conn && state.pid == pid
            })
    }

    /// Append one connection record for the current process.
    ///
    /// The record starts with an empty event-pipe array and no held
    /// lock. Runs under the write lock with the remap guard held for
    /// writing (the table relocates on every append).
    pub fn conn_add(&mut self, conn: u64, pid: u32) -> ShmResult<()> {
        if self.conn_find(conn, pid).is_some() {
            return Err(ShmError::Exists {
                what: format!("connection {conn:#x} of pid {pid}"),
            });
        }
        let conns = self.main.header().conns;
        self.ext.ensure(arr_size::<ConnState>(conns.count + 1))?;
        let new = self.ext.push_entry(conns, ConnState::new(conn, pid));
        self.main.header_mut().conns = new;
        Ok(())
    }

    /// Remove a connection record, freeing its event-pipe array.
    pub fn conn_remove(&mut self, conn: u64, pid: u32) -> ShmResult<()> {
        let idx = self.conn_find(conn, pid).ok_or_else(|| ShmError::NotFound {
            what: format!("connection {conn:#x} of pid {pid}"),
        })?;
        let state = self.conn_state(idx);
        self.ext.free_arr::<u32>(state.evpipes);

        let conns = self.main.header().conns;
        let new = self.ext.swap_remove_entry::<ConnState>(conns, idx as u64);
        self.main.header_mut().conns = new;
        Ok(())
    }

    /// Update the held-lock descriptor of the record at `idx`.
    pub fn set_conn_lock(&mut self, idx: usize, lock: HeldLock) {
        let mut state = self.conn_state(idx);
        state.lock = lock;
        self.write_conn_state(idx, state);
    }

    /// The event-pipe identifiers of the record at `idx`.
    pub fn evpipes(&self, idx: usize) -> &[u32] {
        let state = self.conn_state(idx);
        self.ext.slice_at::<u32>(state.evpipes.off, state.evpipes.count)
    }

    /// Register an event pipe on the record at `idx`.
    pub fn evpipe_add(&mut self, idx: usize, evpipe: u32) -> ShmResult<()> {
        let mut state = self.conn_state(idx);
        self.ext.ensure(arr_size::<u32>(state.evpipes.count + 1))?;
        state.evpipes = self.ext.push_entry(state.evpipes, evpipe);
        self.write_conn_state(idx, state);
        Ok(())
    }

    /// Unregister an event pipe from the record at `idx`.
    pub fn evpipe_remove(&mut self, idx: usize, evpipe: u32) -> ShmResult<()> {
        let mut state = self.conn_state(idx);
        let pos = self
            .ext
            .slice_at::<u32>(state.evpipes.off, state.evpipes.count)
            .iter()
            .position(|&id| id == evpipe)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("event pipe {evpipe}"),
            })?;
        state.evpipes = self.ext.swap_remove_entry::<u32>(state.evpipes, pos as u64);
        self.write_conn_state(idx, state);
        Ok(())
    }

    /// Sum of recursive read depths over all connection records.
    ///
    /// Matches the main lock's reader counter whenever the registry is
    /// consistent.
    pub fn reader_depth_sum(&self) -> u32 {
        (0..self.conn_count())
            .map(|idx| {
                let lock = self.conn_state(idx).lock;
                match HeldLockKind::from_u32(lock.mode) {
                    Some(HeldLockKind::Read) => lock.rcount,
                    _ => 0,
                }
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ShmStore) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = ShmStore::open(dir.path(), 0o600).unwrap();
        (dir, store)
    }

    #[test]
    fn conn_add_find_remove() {
        let (_dir, mut store) = temp_store();
        store.conn_add(0x10, 100).unwrap();
        store.conn_add(0x20, 100).unwrap();
        store.conn_add(0x10, 200).unwrap();
        assert_eq!(store.conn_count(), 3);

        // Keyed by the (handle, pid) pair.
        assert!(store.conn_find(0x10, 100).is_some());
        assert!(store.conn_find(0x10, 300).is_none());
        assert!(matches!(
            store.conn_add(0x10, 100),
            Err(ShmError::Exists { .. })
        ));

        store.conn_remove(0x20, 100).unwrap();
        assert_eq!(store.conn_count(), 2);
        assert!(store.conn_find(0x10, 100).is_some());
        assert!(store.conn_find(0x10, 200).is_some());

        assert!(matches!(
            store.conn_remove(0x20, 100),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn removing_last_connection_resets_table() {
        let (_dir, mut store) = temp_store();
        store.conn_add(0x10, 100).unwrap();
        store.conn_remove(0x10, 100).unwrap();
        assert_eq!(store.conn_count(), 0);
        assert!(store.main().header().conns.is_empty());
    }

    #[test]
    fn evpipe_roundtrip_restores_structure() {
        let (_dir, mut store) = temp_store();
        store.conn_add(0x10, 100).unwrap();
        let idx = store.conn_find(0x10, 100).unwrap();
        let before = store.conn_state(idx);

        store.evpipe_add(idx, 7).unwrap();
        assert_eq!(store.evpipes(idx), &[7]);
        store.evpipe_remove(idx, 7).unwrap();

        let after = store.conn_state(idx);
        assert_eq!(after.conn, before.conn);
        assert_eq!(after.pid, before.pid);
        assert!(after.evpipes.is_empty());
        // The round trip only grew the wasted tally.
        assert!(store.ext().wasted() > 0);
    }

    #[test]
    fn evpipe_remove_missing_is_not_found() {
        let (_dir, mut store) = temp_store();
        store.conn_add(0x10, 100).unwrap();
        let idx = store.conn_find(0x10, 100).unwrap();
        assert!(matches!(
            store.evpipe_remove(idx, 42),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn held_lock_descriptor_updates() {
        let (_dir, mut store) = temp_store();
        store.conn_add(0x10, 100).unwrap();
        let idx = store.conn_find(0x10, 100).unwrap();
        assert_eq!(store.reader_depth_sum(), 0);

        store.set_conn_lock(
            idx,
            HeldLock {
                mode: HeldLockKind::Read as u32,
                rcount: 2,
            },
        );
        assert_eq!(store.reader_depth_sum(), 2);

        store.set_conn_lock(idx, HeldLock::NONE);
        assert_eq!(store.reader_depth_sum(), 0);
    }
}
