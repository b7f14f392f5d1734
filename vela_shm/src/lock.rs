//! Cross-process lock primitives over PID-tagged atomics.
//!
//! The lock words live inside the mapped main header, so every process
//! attached to the region contends on the same atomics. A writer claims
//! the `writer` word with its PID and then waits for the reader count to
//! drain; readers increment the count only while the word is clear.
//! Writers are therefore preferred, and the lock is not fair.
//!
//! None of these primitives recover a dead holder on their own: they
//! report the observed holder on timeout and the connection layer
//! decides whether to reclaim (see [`crate::conn`]).

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use vela::consts::LOCK_RETRY_SLEEP;

use crate::layout::{ShmMutex, ShmRwLock};

/// Main-lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared read access; recursive per connection.
    Read,
    /// Exclusive write access; recursion is refused.
    Write,
    /// Exclusive write access before the per-connection state exists;
    /// skips the held-lock bookkeeping.
    WriteNoState,
}

impl ShmRwLock {
    /// Acquire a read hold within `timeout`.
    ///
    /// On timeout returns the PID of the writer blocking entry (0 when
    /// the writer raced away between observations).
    pub fn read_acquire(&self, timeout: Duration) -> Result<(), u32> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.writer.load(Ordering::Acquire) == 0 {
                self.readers.fetch_add(1, Ordering::AcqRel);
                if self.writer.load(Ordering::Acquire) == 0 {
                    return Ok(());
                }
                // A writer claimed the word mid-entry; back out.
                self.readers.fetch_sub(1, Ordering::AcqRel);
            }
            if Instant::now() >= deadline {
                return Err(self.writer.load(Ordering::Acquire));
            }
            std::thread::sleep(LOCK_RETRY_SLEEP);
        }
    }

    /// Release one read hold.
    pub fn read_release(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "read release without hold");
    }

    /// Return a dead reader's recursive depth to the counter.
    pub fn reader_return(&self, depth: u32) {
        if depth > 0 {
            self.readers.fetch_sub(depth, Ordering::AcqRel);
        }
    }

    /// Claim the writer word within `timeout`; readers may still hold.
    ///
    /// On timeout returns the PID of the current holder.
    pub fn claim_writer(&self, pid: u32, timeout: Duration) -> Result<(), u32> {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .writer
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(holder) => {
                    if Instant::now() >= deadline {
                        return Err(holder);
                    }
                }
            }
            std::thread::sleep(LOCK_RETRY_SLEEP);
        }
    }

    /// Wait for the reader count to drain within `timeout`.
    ///
    /// Only meaningful while holding the writer word. On timeout
    /// returns the observed reader count.
    pub fn wait_no_readers(&self, timeout: Duration) -> Result<(), u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let readers = self.readers.load(Ordering::Acquire);
            if readers == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(readers);
            }
            std::thread::sleep(LOCK_RETRY_SLEEP);
        }
    }

    /// Convert a write hold into a read hold.
    pub fn downgrade_writer(&self, pid: u32) -> bool {
        self.readers.fetch_add(1, Ordering::AcqRel);
        self.release_writer(pid)
    }

    /// Release the writer word; `false` if `pid` was not the holder.
    pub fn release_writer(&self, pid: u32) -> bool {
        self.writer
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reclaim the writer word from `from` (a dead holder) to `to`.
    pub fn force_writer(&self, from: u32, to: u32) -> bool {
        self.writer
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current writer PID, 0 when unheld.
    pub fn writer_pid(&self) -> u32 {
        self.writer.load(Ordering::Acquire)
    }

    /// Current reader count.
    pub fn reader_count(&self) -> u32 {
        self.readers.load(Ordering::Acquire)
    }
}

impl ShmMutex {
    /// Acquire within `timeout`; on timeout returns the current owner.
    pub fn acquire(&self, owner: u32, timeout: Duration) -> Result<(), u32> {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .owner
                .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(holder) => {
                    if Instant::now() >= deadline {
                        return Err(holder);
                    }
                }
            }
            std::thread::sleep(LOCK_RETRY_SLEEP);
        }
    }

    /// Try to acquire without blocking.
    pub fn try_acquire(&self, owner: u32) -> bool {
        self.owner
            .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release; `false` if `owner` was not the holder.
    pub fn release(&self, owner: u32) -> bool {
        self.owner
            .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reclaim from `from` (a dead holder) to `to`.
    pub fn force(&self, from: u32, to: u32) -> bool {
        self.owner
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current owner, 0 when unheld.
    pub fn holder(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }
}

impl crate::store::ShmStore {
    /// Take a module's per-datastore data lock for a session.
    ///
    /// Non-blocking: candidate/running locks are held across client
    /// calls, so a busy lock surfaces immediately instead of stalling
    /// a worker thread.
    pub fn module_data_lock(
        &self,
        mod_idx: usize,
        ds: vela::msg::Datastore,
        session_id: u32,
    ) -> Result<(), u32> {
        let mutex = &self.main().module(mod_idx).data_locks[ds as usize];
        if mutex.try_acquire(session_id) {
            Ok(())
        } else {
            Err(mutex.holder())
        }
    }

    /// Release a module's per-datastore data lock; `false` if the
    /// session was not the holder.
    pub fn module_data_unlock(
        &self,
        mod_idx: usize,
        ds: vela::msg::Datastore,
        session_id: u32,
    ) -> bool {
        self.main().module(mod_idx).data_locks[ds as usize].release(session_id)
    }

    /// Take a module's notification-replay lock for a session.
    pub fn module_replay_lock(&self, mod_idx: usize, session_id: u32) -> Result<(), u32> {
        let mutex = &self.main().module(mod_idx).replay_lock;
        if mutex.try_acquire(session_id) {
            Ok(())
        } else {
            Err(mutex.holder())
        }
    }

    /// Release a module's notification-replay lock.
    pub fn module_replay_unlock(&self, mod_idx: usize, session_id: u32) -> bool {
        self.main().module(mod_idx).replay_lock.release(session_id)
    }
}
