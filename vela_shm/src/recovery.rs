//! Liveness recovery: sweep the state of crashed peers.
//!
//! Runs under the write side of the main lock. For every connection
//! record whose PID is gone, the sweep returns its read-lock depth to
//! the reader counter, purges its subscriptions everywhere, delegates
//! operational-data removal to the storage collaborator and removes the
//! record itself. Sub-step failures are accumulated into the report and
//! never abort the loop; only a write lock held by a dead PID is fatal.

use vela::msg::Datastore;

use crate::error::{ShmError, ShmResult};
use crate::layout::{HeldLock, HeldLockKind};
use crate::shm_file::is_process_alive;
use crate::store::ShmStore;

/// Callback removing operational data stored by a dead connection.
pub type OperCleanup = dyn Fn(u64) -> ShmResult<()> + Send + Sync;

/// Outcome of one recovery sweep.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Dead connections removed.
    pub connections_removed: usize,
    /// Accumulated sub-step failures.
    pub errors: Vec<String>,
}

impl ShmStore {
    /// Sweep all connection records of dead processes.
    pub fn recover(&mut self, oper_cleanup: Option<&OperCleanup>) -> ShmResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut idx = 0;
        while idx < self.conn_count() {
            let state = self.conn_state(idx);
            if is_process_alive(state.pid) {
                idx += 1;
                continue;
            }
            tracing::warn!(
                pid = state.pid,
                conn = format_args!("{:#x}", state.conn),
                "recovering state of dead process"
            );

            match HeldLockKind::from_u32(state.lock.mode) {
                Some(HeldLockKind::Write) => {
                    // The filesystem lock releases a write hold on
                    // process exit; a surviving write descriptor means
                    // the region is inconsistent.
                    return Err(ShmError::Internal {
                        reason: format!("dead pid {} still holds the write lock", state.pid),
                    });
                }
                Some(HeldLockKind::Read) => {
                    self.main.header().main_lock.reader_return(state.lock.rcount);
                }
                _ => {}
            }

            let evpipes: Vec<u32> = self.evpipes(idx).to_vec();
            for evpipe in evpipes {
                self.purge_evpipe(evpipe);
            }

            if let Some(cleanup) = oper_cleanup {
                if let Err(e) = cleanup(state.conn) {
                    report
                        .errors
                        .push(format!("operational data of {:#x}: {e}", state.conn));
                }
            }

            match self.conn_remove(state.conn, state.pid) {
                Ok(()) => report.connections_removed += 1,
                Err(e) => {
                    report
                        .errors
                        .push(format!("connection {:#x}: {e}", state.conn));
                    idx += 1;
                }
            }
            // On success the swap brought a fresh entry into this slot;
            // do not advance.
        }

        if !report.errors.is_empty() {
            tracing::warn!(
                errors = report.errors.len(),
                "recovery finished with accumulated failures"
            );
        }
        Ok(report)
    }

    /// Remove every subscription of one event pipe across all modules
    /// and RPCs; an RPC losing its last subscription is removed too.
    pub(crate) fn purge_evpipe(&mut self, evpipe: u32) {
        for mod_idx in 0..self.main.module_count() {
            for ds in [Datastore::Startup, Datastore::Running, Datastore::Candidate] {
                self.change_sub_remove_by_evpipe(mod_idx, ds, evpipe);
            }
            self.oper_sub_remove_by_evpipe(mod_idx, evpipe);
            self.notif_sub_remove_by_evpipe(mod_idx, evpipe);
        }

        let mut rpc_idx = 0;
        while rpc_idx < self.rpc_count() {
            let removed = self.rpc_sub_remove_by_evpipe(rpc_idx, evpipe);
            if removed > 0 && self.rpc(rpc_idx).subs.is_empty() {
                self.remove_rpc_at(rpc_idx);
                // The swap brought another RPC into this slot.
            } else {
                rpc_idx += 1;
            }
        }
    }

    /// Return the read depth of every dead connection to the reader
    /// counter without removing the records; used while a writer is
    /// waiting for stuck readers to drain. Returns the total depth
    /// returned.
    pub(crate) fn return_dead_reader_depths(&mut self) -> u32 {
        let mut returned = 0;
        for idx in 0..self.conn_count() {
            let state = self.conn_state(idx);
            if is_process_alive(state.pid) {
                continue;
            }
            if HeldLockKind::from_u32(state.lock.mode) == Some(HeldLockKind::Read)
                && state.lock.rcount > 0
            {
                self.main.header().main_lock.reader_return(state.lock.rcount);
                self.set_conn_lock(idx, HeldLock::NONE);
                returned += state.lock.rcount;
            }
        }
        returned
    }

    /// Clear the write-hold descriptor of a dead PID after its lock
    /// word was reclaimed, restoring the descriptor/counter invariant
    /// before the sweep runs.
    pub(crate) fn clear_dead_writer_descriptor(&mut self, pid: u32) {
        for idx in 0..self.conn_count() {
            let state = self.conn_state(idx);
            if state.pid == pid
                && HeldLockKind::from_u32(state.lock.mode) == Some(HeldLockKind::Write)
            {
                self.set_conn_lock(idx, HeldLock::NONE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleImport;
    use vela::msg::ChangeSubOpts;

    /// A PID above the kernel's pid_max, guaranteed dead.
    const DEAD_PID: u32 = 0x7FFF_FFFF;

    fn store_with_module() -> (tempfile::TempDir, ShmStore, usize) {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = ShmStore::open(dir.path(), 0o600).unwrap();
        store
            .add_modules(&[ModuleImport {
                name: "m1".to_owned(),
                ..Default::default()
            }])
            .unwrap();
        let idx = store.find_module("m1").unwrap();
        (dir, store, idx)
    }

    #[test]
    fn sweep_removes_dead_connection_state() {
        let (_dir, mut store, mod_idx) = store_with_module();

        // A dead peer with a read hold, an event pipe and subscriptions.
        store.conn_add(0xDEAD, DEAD_PID).unwrap();
        let conn_idx = store.conn_find(0xDEAD, DEAD_PID).unwrap();
        store.evpipe_add(conn_idx, 7).unwrap();
        store
            .main()
            .header()
            .main_lock
            .read_acquire(std::time::Duration::from_millis(10))
            .unwrap();
        store.set_conn_lock(
            conn_idx,
            HeldLock {
                mode: HeldLockKind::Read as u32,
                rcount: 1,
            },
        );
        store
            .oper_sub_add(mod_idx, "/m1:state", 7)
            .unwrap();
        store.add_rpc("/m1:reset").unwrap();
        let rpc_idx = store.find_rpc("/m1:reset").unwrap();
        store.rpc_sub_add(rpc_idx, "/m1:reset", 0, 7).unwrap();

        // A live peer that must survive the sweep.
        store.conn_add(0x11FE, crate::shm_file::current_pid()).unwrap();

        let report = store.recover(None).unwrap();
        assert_eq!(report.connections_removed, 1);
        assert!(report.errors.is_empty());

        assert!(store.conn_find(0xDEAD, DEAD_PID).is_none());
        assert!(store.conn_find(0x11FE, crate::shm_file::current_pid()).is_some());
        assert_eq!(store.main().header().main_lock.reader_count(), 0);
        assert!(store.main().module(mod_idx).oper_subs.is_empty());
        // The RPC lost its last subscription and was removed with it.
        assert_eq!(store.rpc_count(), 0);
    }

    #[test]
    fn sweep_keeps_other_subscribers() {
        let (_dir, mut store, mod_idx) = store_with_module();
        store.conn_add(0xDEAD, DEAD_PID).unwrap();
        let conn_idx = store.conn_find(0xDEAD, DEAD_PID).unwrap();
        store.evpipe_add(conn_idx, 7).unwrap();

        store
            .change_sub_add(mod_idx, Datastore::Running, None, 0, ChangeSubOpts::empty(), 7)
            .unwrap();
        store
            .change_sub_add(mod_idx, Datastore::Running, None, 1, ChangeSubOpts::empty(), 9)
            .unwrap();

        store.recover(None).unwrap();
        let subs = store.main().module(mod_idx).change_subs[Datastore::Running as usize];
        assert_eq!(subs.count, 1);
    }

    #[test]
    fn dead_write_holder_is_fatal() {
        let (_dir, mut store, _) = store_with_module();
        store.conn_add(0xDEAD, DEAD_PID).unwrap();
        let conn_idx = store.conn_find(0xDEAD, DEAD_PID).unwrap();
        store.set_conn_lock(
            conn_idx,
            HeldLock {
                mode: HeldLockKind::Write as u32,
                rcount: 0,
            },
        );
        assert!(matches!(
            store.recover(None),
            Err(ShmError::Internal { .. })
        ));
    }

    #[test]
    fn oper_cleanup_failures_accumulate() {
        let (_dir, mut store, _) = store_with_module();
        store.conn_add(0xDEAD, DEAD_PID).unwrap();

        let cleanup = |conn: u64| -> ShmResult<()> {
            Err(ShmError::Internal {
                reason: format!("no store for {conn:#x}"),
            })
        };
        let report = store.recover(Some(&cleanup)).unwrap();
        // The failure is recorded, the sweep still removed the record.
        assert_eq!(report.connections_removed, 1);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn dead_reader_depth_prepass() {
        let (_dir, mut store, _) = store_with_module();
        store.conn_add(0xDEAD, DEAD_PID).unwrap();
        let conn_idx = store.conn_find(0xDEAD, DEAD_PID).unwrap();
        store
            .main()
            .header()
            .main_lock
            .read_acquire(std::time::Duration::from_millis(10))
            .unwrap();
        store.set_conn_lock(
            conn_idx,
            HeldLock {
                mode: HeldLockKind::Read as u32,
                rcount: 1,
            },
        );

        assert_eq!(store.return_dead_reader_depths(), 1);
        assert_eq!(store.main().header().main_lock.reader_count(), 0);
        // The record itself is still there until the full sweep runs.
        assert!(store.conn_find(0xDEAD, DEAD_PID).is_some());
        assert_eq!(store.reader_depth_sum(), 0);
    }
}
