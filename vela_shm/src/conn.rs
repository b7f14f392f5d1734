//! Process-local connection to the shared regions.
//!
//! [`ShmConn`] owns the mapped regions of one process connection and
//! implements the public locking protocol: remap guard, then main lock,
//! then optionally the schema mutex, unwound in reverse on failure.
//! Lock acquisitions are bounded; when the observed holder is dead the
//! lock is reclaimed and the liveness sweep runs before the caller
//! proceeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use vela::config::VelaConfig;
use vela::consts::DEFRAG_MIN_WASTED;

use crate::error::{ShmError, ShmResult};
use crate::layout::{HeldLock, HeldLockKind, ShmMutex, ShmRwLock};
use crate::lock::LockMode;
use crate::recovery::OperCleanup;
use crate::repo;
use crate::shm_file::{RepoLock, current_pid, is_process_alive};
use crate::store::ShmStore;

/// Source of opaque connection handles; unique within the process,
/// unique system-wide when paired with the PID.
static NEXT_CONN_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Grace period for readers to drain after dead depths were returned.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// One process connection to a repository.
pub struct ShmConn {
    store: ShmStore,
    config: VelaConfig,
    conn_id: u64,
    pid: u32,
    oper_cleanup: Option<Box<OperCleanup>>,
    attached: bool,
}

impl ShmConn {
    /// Attach to (or create) the repository and install the
    /// connection-state record.
    pub fn connect(config: &VelaConfig) -> ShmResult<Self> {
        config.validate().map_err(|e| ShmError::InitFailed {
            reason: e.to_string(),
        })?;
        repo::init_dirs(config)?;

        // The creation gate serializes one-time header initialization
        // against concurrent attaches.
        let gate = RepoLock::acquire(&repo::repo_lock_path(config), config.file_mode)?;
        let (store, created) = ShmStore::open(&config.repo_path, config.file_mode)?;

        let mut conn = Self {
            store,
            config: config.clone(),
            conn_id: NEXT_CONN_HANDLE.fetch_add(1, Ordering::SeqCst),
            pid: current_pid(),
            oper_cleanup: None,
            attached: false,
        };

        // The very first acquisition happens before our own state
        // record exists.
        conn.lock(LockMode::WriteNoState, true, false)?;
        let setup = conn.setup_state();
        conn.unlock(LockMode::WriteNoState, true, false)?;
        setup?;

        conn.attached = true;
        drop(gate);
        tracing::info!(
            conn = format_args!("{:#x}", conn.conn_id),
            pid = conn.pid,
            created,
            repo = %config.repo_path.display(),
            "attached to repository"
        );
        Ok(conn)
    }

    fn setup_state(&mut self) -> ShmResult<()> {
        self.store.conn_add(self.conn_id, self.pid)?;
        if self.store.ext().wasted() >= DEFRAG_MIN_WASTED {
            self.store.defragment()?;
        }
        repo::ensure_running_data(&self.store, &self.config)?;
        Ok(())
    }

    /// Detach, removing the connection-state record.
    pub fn disconnect(mut self) -> ShmResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> ShmResult<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        self.lock(LockMode::Write, false, false)?;
        let removed = self.store.conn_remove(self.conn_id, self.pid);
        self.unlock(LockMode::Write, false, false)?;
        removed
    }

    /// The opaque connection handle stored in the state record.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// The owning PID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The configuration this connection attached with.
    pub fn config(&self) -> &VelaConfig {
        &self.config
    }

    /// Shared access to the regions.
    pub fn store(&self) -> &ShmStore {
        &self.store
    }

    /// Mutable access to the regions; callers hold the appropriate
    /// locks via [`ShmConn::lock`].
    pub fn store_mut(&mut self) -> &mut ShmStore {
        &mut self.store
    }

    /// Install the storage-collaborator callback that removes a dead
    /// connection's operational data during recovery.
    pub fn set_oper_cleanup(&mut self, cleanup: Box<OperCleanup>) {
        self.oper_cleanup = Some(cleanup);
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.main_lock_timeout_s)
    }

    fn main_lock(&self) -> &ShmRwLock {
        &self.store.main().header().main_lock
    }

    fn remap_lock(&self) -> &ShmRwLock {
        &self.store.main().header().remap_lock
    }

    fn schema_lock(&self) -> &ShmMutex {
        &self.store.main().header().schema_lock
    }

    fn run_recovery(&mut self) -> ShmResult<()> {
        let cleanup = self.oper_cleanup.as_deref();
        let report = self.store.recover(cleanup)?;
        if report.connections_removed > 0 {
            tracing::info!(
                removed = report.connections_removed,
                "liveness sweep removed dead connections"
            );
        }
        Ok(())
    }

    /// Acquire the locking sequence: remap guard (read, or write when
    /// `remap` is set), main lock in `mode`, then optionally the schema
    /// mutex. Already-acquired locks unwind in reverse on any failure.
    pub fn lock(&mut self, mode: LockMode, remap: bool, schema: bool) -> ShmResult<()> {
        let timeout = self.timeout();
        self.acquire_remap(remap, timeout)?;

        if let Err(e) = self.check_recursion(mode) {
            self.release_remap(remap);
            return Err(e);
        }
        if let Err(e) = self.acquire_main(mode, timeout) {
            self.release_remap(remap);
            return Err(e);
        }
        if schema {
            if let Err(e) = self.acquire_schema(timeout) {
                self.release_main(mode);
                self.release_remap(remap);
                return Err(e);
            }
        }
        if mode != LockMode::WriteNoState {
            if let Err(e) = self.record_held(mode) {
                if schema {
                    self.schema_lock().release(self.pid);
                }
                self.release_main(mode);
                self.release_remap(remap);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Symmetric release of [`ShmConn::lock`].
    pub fn unlock(&mut self, mode: LockMode, remap: bool, schema: bool) -> ShmResult<()> {
        if schema && !self.schema_lock().release(self.pid) {
            tracing::warn!(pid = self.pid, "schema mutex released without ownership");
        }
        if mode != LockMode::WriteNoState {
            self.record_released(mode)?;
        }
        self.release_main(mode);
        self.release_remap(remap);
        Ok(())
    }

    fn acquire_remap(&mut self, remap: bool, timeout: Duration) -> ShmResult<()> {
        if remap {
            match self.remap_lock().claim_writer(self.pid, timeout) {
                Ok(()) => {}
                Err(holder) if holder != 0 && !is_process_alive(holder) => {
                    if self.remap_lock().force_writer(holder, self.pid) {
                        tracing::warn!(holder, "reclaimed remap guard from dead writer");
                    } else {
                        self.remap_lock()
                            .claim_writer(self.pid, timeout)
                            .map_err(|h| ShmError::Timeout {
                                what: format!("remap guard held by pid {h}"),
                            })?;
                    }
                }
                Err(holder) => {
                    return Err(ShmError::Timeout {
                        what: format!("remap guard held by pid {holder}"),
                    });
                }
            }
            if let Err(readers) = self.remap_lock().wait_no_readers(timeout) {
                // Remap-guard read holds are not tracked per connection,
                // so stuck readers cannot be attributed to a dead peer.
                self.remap_lock().release_writer(self.pid);
                return Err(ShmError::Timeout {
                    what: format!("remap guard with {readers} readers stuck"),
                });
            }
            Ok(())
        } else {
            match self.remap_lock().read_acquire(timeout) {
                Ok(()) => Ok(()),
                Err(holder) if holder != 0 && !is_process_alive(holder) => {
                    if self.remap_lock().force_writer(holder, 0) {
                        tracing::warn!(
                            holder,
                            "cleared remap guard of dead writer; arena may need compaction"
                        );
                    }
                    self.remap_lock()
                        .read_acquire(timeout)
                        .map_err(|h| ShmError::Timeout {
                            what: format!("remap guard held by pid {h}"),
                        })
                }
                Err(holder) => Err(ShmError::Timeout {
                    what: format!("remap guard held by pid {holder}"),
                }),
            }
        }
    }

    fn release_remap(&self, remap: bool) {
        if remap {
            if !self.remap_lock().release_writer(self.pid) {
                tracing::warn!(pid = self.pid, "remap guard released without ownership");
            }
        } else {
            self.remap_lock().read_release();
        }
    }

    /// Refuse lock recursion the main lock cannot express: any second
    /// acquisition on a write hold, and a write on top of a read hold.
    fn check_recursion(&self, mode: LockMode) -> ShmResult<()> {
        let Some(idx) = self.store.conn_find(self.conn_id, self.pid) else {
            return Ok(());
        };
        let held = self.store.conn_state(idx).lock;
        match (HeldLockKind::from_u32(held.mode), mode) {
            (Some(HeldLockKind::Write), _) => Err(ShmError::Internal {
                reason: "main lock recursion on a write hold".to_owned(),
            }),
            (Some(HeldLockKind::Read), LockMode::Write | LockMode::WriteNoState) => {
                Err(ShmError::Internal {
                    reason: "write lock requested while holding a read lock".to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    fn acquire_main(&mut self, mode: LockMode, timeout: Duration) -> ShmResult<()> {
        match mode {
            LockMode::Read => match self.main_lock().read_acquire(timeout) {
                Ok(()) => Ok(()),
                Err(holder) if holder != 0 && !is_process_alive(holder) => {
                    if self.main_lock().force_writer(holder, self.pid) {
                        tracing::warn!(holder, "reclaimed main lock from dead writer");
                        self.store.clear_dead_writer_descriptor(holder);
                        if let Err(e) = self.run_recovery() {
                            self.main_lock().release_writer(self.pid);
                            return Err(e);
                        }
                        // Recovery ran under the reclaimed write hold;
                        // keep only the read we were asked for.
                        self.main_lock().downgrade_writer(self.pid);
                        Ok(())
                    } else {
                        self.main_lock()
                            .read_acquire(timeout)
                            .map_err(|h| ShmError::Timeout {
                                what: format!("main lock held by pid {h}"),
                            })
                    }
                }
                Err(holder) => Err(ShmError::Timeout {
                    what: format!("main lock held by pid {holder}"),
                }),
            },
            LockMode::Write | LockMode::WriteNoState => {
                match self.main_lock().claim_writer(self.pid, timeout) {
                    Ok(()) => {}
                    Err(holder) if holder != 0 && !is_process_alive(holder) => {
                        if self.main_lock().force_writer(holder, self.pid) {
                            tracing::warn!(holder, "reclaimed main lock from dead writer");
                            self.store.clear_dead_writer_descriptor(holder);
                        } else {
                            self.main_lock()
                                .claim_writer(self.pid, timeout)
                                .map_err(|h| ShmError::Timeout {
                                    what: format!("main lock held by pid {h}"),
                                })?;
                        }
                    }
                    Err(holder) => {
                        return Err(ShmError::Timeout {
                            what: format!("main lock held by pid {holder}"),
                        });
                    }
                }

                if self.main_lock().wait_no_readers(timeout).is_err() {
                    // Dead readers cannot drain on their own; return
                    // their recorded depths and give live ones a grace
                    // period.
                    let returned = self.store.return_dead_reader_depths();
                    let drained = returned > 0
                        && self.main_lock().wait_no_readers(READER_DRAIN_GRACE).is_ok();
                    if !drained {
                        let readers = self.main_lock().reader_count();
                        self.main_lock().release_writer(self.pid);
                        return Err(ShmError::Timeout {
                            what: format!("main lock with {readers} readers held"),
                        });
                    }
                }

                // Write acquisition is the trigger for the liveness
                // sweep.
                if let Err(e) = self.run_recovery() {
                    self.main_lock().release_writer(self.pid);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn release_main(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.main_lock().read_release(),
            LockMode::Write | LockMode::WriteNoState => {
                if !self.main_lock().release_writer(self.pid) {
                    tracing::warn!(pid = self.pid, "main lock released without ownership");
                }
            }
        }
    }

    fn acquire_schema(&mut self, timeout: Duration) -> ShmResult<()> {
        match self.schema_lock().acquire(self.pid, timeout) {
            Ok(()) => Ok(()),
            Err(holder) if holder != 0 && !is_process_alive(holder) => {
                if self.schema_lock().force(holder, self.pid) {
                    tracing::warn!(holder, "reclaimed schema mutex from dead holder");
                    Ok(())
                } else {
                    self.schema_lock()
                        .acquire(self.pid, timeout)
                        .map_err(|h| ShmError::Timeout {
                            what: format!("schema mutex held by {h}"),
                        })
                }
            }
            Err(holder) => Err(ShmError::Timeout {
                what: format!("schema mutex held by {holder}"),
            }),
        }
    }

    fn record_held(&mut self, mode: LockMode) -> ShmResult<()> {
        let idx = self
            .store
            .conn_find(self.conn_id, self.pid)
            .ok_or_else(|| ShmError::Internal {
                reason: "no connection state for lock bookkeeping".to_owned(),
            })?;
        let mut held = self.store.conn_state(idx).lock;
        match mode {
            LockMode::Read => {
                held.mode = HeldLockKind::Read as u32;
                held.rcount += 1;
            }
            LockMode::Write => {
                held.mode = HeldLockKind::Write as u32;
                held.rcount = 0;
            }
            LockMode::WriteNoState => unreachable!("bookkeeping skipped for WRITE_NOSTATE"),
        }
        self.store.set_conn_lock(idx, held);
        Ok(())
    }

    fn record_released(&mut self, mode: LockMode) -> ShmResult<()> {
        // The record may already be gone when the hold being released
        // covered the connection's own removal.
        let Some(idx) = self.store.conn_find(self.conn_id, self.pid) else {
            tracing::debug!(
                conn = format_args!("{:#x}", self.conn_id),
                "lock released after connection-state removal"
            );
            return Ok(());
        };
        let mut held = self.store.conn_state(idx).lock;
        match mode {
            LockMode::Read => {
                held.rcount = held.rcount.saturating_sub(1);
                if held.rcount == 0 {
                    held = HeldLock::NONE;
                }
            }
            LockMode::Write => held = HeldLock::NONE,
            LockMode::WriteNoState => unreachable!("bookkeeping skipped for WRITE_NOSTATE"),
        }
        self.store.set_conn_lock(idx, held);
        Ok(())
    }
}

impl Drop for ShmConn {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.teardown() {
                tracing::warn!(
                    conn = format_args!("{:#x}", self.conn_id),
                    error = %e,
                    "connection teardown failed on drop"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> VelaConfig {
        VelaConfig {
            repo_path: dir.join("repo"),
            shm_dir: dir.join("shm"),
            main_lock_timeout_s: 1,
            ..Default::default()
        }
    }

    #[test]
    fn connect_installs_connection_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shm")).unwrap();
        let config = test_config(dir.path());

        let conn = ShmConn::connect(&config).unwrap();
        assert_eq!(conn.store().conn_count(), 1);
        let idx = conn.store().conn_find(conn.conn_id(), conn.pid()).unwrap();
        let state = conn.store().conn_state(idx);
        assert_eq!(state.pid, current_pid());
        assert_eq!(state.lock.mode, HeldLockKind::None as u32);

        conn.disconnect().unwrap();
    }

    #[test]
    fn recursive_read_lock_counts_depth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shm")).unwrap();
        let config = test_config(dir.path());
        let mut conn = ShmConn::connect(&config).unwrap();

        conn.lock(LockMode::Read, false, false).unwrap();
        conn.lock(LockMode::Read, false, false).unwrap();

        let idx = conn.store().conn_find(conn.conn_id(), conn.pid()).unwrap();
        let held = conn.store().conn_state(idx).lock;
        assert_eq!(held.mode, HeldLockKind::Read as u32);
        assert_eq!(held.rcount, 2);
        assert_eq!(conn.store().main().header().main_lock.reader_count(), 2);
        assert_eq!(conn.store().reader_depth_sum(), 2);

        conn.unlock(LockMode::Read, false, false).unwrap();
        conn.unlock(LockMode::Read, false, false).unwrap();

        let idx = conn.store().conn_find(conn.conn_id(), conn.pid()).unwrap();
        assert_eq!(conn.store().conn_state(idx).lock.mode, HeldLockKind::None as u32);
        assert_eq!(conn.store().main().header().main_lock.reader_count(), 0);
    }

    #[test]
    fn write_recursion_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shm")).unwrap();
        let config = test_config(dir.path());
        let mut conn = ShmConn::connect(&config).unwrap();

        conn.lock(LockMode::Write, false, false).unwrap();
        assert!(matches!(
            conn.lock(LockMode::Write, false, false),
            Err(ShmError::Internal { .. })
        ));
        assert!(matches!(
            conn.lock(LockMode::Read, false, false),
            Err(ShmError::Internal { .. })
        ));
        conn.unlock(LockMode::Write, false, false).unwrap();

        // Upgrades are refused too.
        conn.lock(LockMode::Read, false, false).unwrap();
        assert!(matches!(
            conn.lock(LockMode::Write, false, false),
            Err(ShmError::Internal { .. })
        ));
        conn.unlock(LockMode::Read, false, false).unwrap();
    }

    #[test]
    fn schema_mutex_follows_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shm")).unwrap();
        let config = test_config(dir.path());
        let mut conn = ShmConn::connect(&config).unwrap();

        conn.lock(LockMode::Write, true, true).unwrap();
        assert_eq!(conn.store().main().header().schema_lock.holder(), conn.pid());
        assert_eq!(conn.store().main().header().remap_lock.writer_pid(), conn.pid());
        conn.unlock(LockMode::Write, true, true).unwrap();
        assert_eq!(conn.store().main().header().schema_lock.holder(), 0);
        assert_eq!(conn.store().main().header().remap_lock.writer_pid(), 0);
    }
}
