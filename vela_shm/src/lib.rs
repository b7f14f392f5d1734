//! # vela shared-memory coordination layer
//!
//! The engine's processes cooperate through two memory-mapped regions
//! under the configured repository path:
//!
//! - the **main region**: a fixed header (locks, id counters, table
//!   pointers) followed by a dense array of module records;
//! - the **extension region**: an offset arena holding every
//!   variable-length structure (strings, dependency arrays,
//!   subscription tables, connection state), addressed by
//!   base-relative offsets with 0 meaning "absent".
//!
//! ```text
//! ┌────────────────┐   ┌──────────────────┐   ┌────────────────┐
//! │   Process A    │   │   Shared files   │   │   Process B    │
//! │                │   │                  │   │                │
//! │ ShmConn ───────┼──►│ main: header +   │◄──┼─────── ShmConn │
//! │  lock/unlock   │   │   module records │   │                │
//! │  registry ops  │   │ ext: offset arena│   │  liveness sweep│
//! └────────────────┘   └──────────────────┘   └────────────────┘
//! ```
//!
//! Mutations run under a two-level protocol: a remap guard (read side
//! for arena use, write side for anything that may remap it) and the
//! main read/write lock, with per-connection held-lock bookkeeping so
//! crashed peers can be swept by PID liveness. Freed arena entries only
//! grow a wasted-bytes tally; defragmentation compacts the arena into
//! exactly its live size.
//!
//! ## Crash recovery
//!
//! Every lock acquisition is bounded. On timeout, a dead holder is
//! reclaimed and the liveness sweep returns its read depth, purges its
//! subscriptions and removes its connection record. A write lock held
//! by a dead PID is a fatal inconsistency.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod conn;
pub mod conn_state;
pub mod defrag;
pub mod error;
pub mod layout;
pub mod lock;
pub mod recovery;
pub mod registry;
pub mod repo;
pub mod shm_file;
pub mod spans;
pub mod store;
pub mod subs;

pub use arena::ExtShm;
pub use conn::ShmConn;
pub use error::{ShmError, ShmResult};
pub use layout::{
    ChangeSub, ConnState, DataDep, DepKind, HeldLock, HeldLockKind, MainHeader, ModuleRecord,
    NotifSub, OffLen, OpDep, OperSub, RpcRecord, RpcSub, ShmMutex, ShmRwLock,
};
pub use lock::LockMode;
pub use recovery::{OperCleanup, RecoveryReport};
pub use registry::{DepImport, ModuleImport, OpDepImport};
pub use spans::Span;
pub use store::{MainShm, ShmStore};
