//! On-SHM record layouts.
//!
//! These are the `repr(C)` structures stored inside the two mapped
//! regions. The format is host-endian and host-ABI-specific; processes
//! on the same host attach to the same files, nothing else is
//! supported.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ main region:  MainHeader │ ModuleRecord │ ModuleRecord │… │
//! ├──────────────────────────────────────────────────────────┤
//! │ ext region:   wasted u64 │ strings / arrays / records  …  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `off` field is an extension-arena offset; 0 denotes "absent".
//! Arena entries are 8-byte aligned so typed reads through
//! [`crate::arena::ExtShm`] are always in bounds and aligned.

use std::sync::atomic::AtomicU32;

use static_assertions::const_assert_eq;
use vela::consts::{DS_COUNT, REVISION_LEN};

/// Offset + element count of one variable-length arena array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct OffLen {
    /// Arena offset of the first element; 0 when the array is absent.
    pub off: u64,
    /// Number of elements.
    pub count: u64,
}

impl OffLen {
    /// Whether the array is absent.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.off == 0 || self.count == 0
    }
}

/// Cross-process read/write lock record.
///
/// `writer` holds the PID of the write holder (0 = none), `readers`
/// counts read holders, recursion included. A writer claims the
/// `writer` word first and then waits for `readers` to drain, so
/// readers and the writer never overlap. Liveness recovery reconciles
/// the counters when a holder dies (the per-connection held-lock
/// descriptor records who owes what).
#[derive(Debug)]
#[repr(C)]
pub struct ShmRwLock {
    /// PID of the current write holder, 0 when unheld.
    pub writer: AtomicU32,
    /// Number of read holds, recursion included.
    pub readers: AtomicU32,
}

impl ShmRwLock {
    /// An unheld lock.
    pub const fn new() -> Self {
        Self {
            writer: AtomicU32::new(0),
            readers: AtomicU32::new(0),
        }
    }
}

impl Default for ShmRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-process mutex record; `owner` is a PID or session id, 0 = free.
#[derive(Debug)]
#[repr(C)]
pub struct ShmMutex {
    /// Current owner, 0 when unheld.
    pub owner: AtomicU32,
}

impl ShmMutex {
    /// An unheld mutex.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
        }
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed header at offset 0 of the main region.
#[derive(Debug)]
#[repr(C)]
pub struct MainHeader {
    /// Magic bytes: must be [`vela::consts::VELA_SHM_MAGIC`].
    pub magic: u64,
    /// Layout version: must be [`vela::consts::VELA_SHM_VER`].
    pub shm_ver: u32,
    _pad0: u32,
    /// Lock guarding logical access to the registry.
    pub main_lock: ShmRwLock,
    /// Lock guarding arena remaps (read = arena use, write = remap).
    pub remap_lock: ShmRwLock,
    /// Mutex guarding schema-model mutations.
    pub schema_lock: ShmMutex,
    /// Monotonic source of session ids, never reused.
    pub next_session_id: AtomicU32,
    /// Monotonic source of event-pipe identifiers.
    pub next_evpipe_id: AtomicU32,
    _pad1: u32,
    /// Connection-state array in the arena.
    pub conns: OffLen,
    /// RPC table in the arena.
    pub rpcs: OffLen,
}

const_assert_eq!(std::mem::size_of::<MainHeader>(), 80);

impl MainHeader {
    /// Fresh header for a newly created main region.
    pub fn new(magic: u64, shm_ver: u32) -> Self {
        Self {
            magic,
            shm_ver,
            _pad0: 0,
            main_lock: ShmRwLock {
                writer: AtomicU32::new(0),
                readers: AtomicU32::new(0),
            },
            remap_lock: ShmRwLock {
                writer: AtomicU32::new(0),
                readers: AtomicU32::new(0),
            },
            schema_lock: ShmMutex {
                owner: AtomicU32::new(0),
            },
            next_session_id: AtomicU32::new(1),
            next_evpipe_id: AtomicU32::new(1),
            _pad1: 0,
            conns: OffLen::default(),
            rpcs: OffLen::default(),
        }
    }
}

/// One module's metadata and subscriber tables.
///
/// Module records form a dense array right after [`MainHeader`]; the
/// array ends at the main-region tail, so the record count is derived
/// from the region size.
#[derive(Debug)]
#[repr(C)]
pub struct ModuleRecord {
    /// Arena offset of the module name.
    pub name: u64,
    /// Revision (`"YYYY-MM-DD"`), NUL-terminated, all zero when absent.
    pub revision: [u8; REVISION_LEN],
    /// [`vela::msg::ModuleFlags`] bits.
    pub flags: u32,
    /// Version counter, incremented on any metadata change.
    pub ver: u32,
    /// Enabled features: array of name offsets.
    pub features: OffLen,
    /// [`DataDep`] array.
    pub data_deps: OffLen,
    /// Inverse dependencies: array of module-name offsets.
    pub inv_deps: OffLen,
    /// [`OpDep`] array.
    pub op_deps: OffLen,
    /// [`ChangeSub`] arrays, indexed by conventional datastore.
    pub change_subs: [OffLen; DS_COUNT],
    /// [`OperSub`] array.
    pub oper_subs: OffLen,
    /// [`NotifSub`] array; the count here is the only notification
    /// subscription count, and all sizing multiplies it by the record
    /// size.
    pub notif_subs: OffLen,
    /// Per-datastore data locks, held by session id.
    pub data_locks: [ShmMutex; DS_COUNT],
    /// Notification replay lock, held by session id.
    pub replay_lock: ShmMutex,
}

const_assert_eq!(std::mem::size_of::<ModuleRecord>(), 192);

impl ModuleRecord {
    /// Fresh record with empty tables and unheld locks.
    pub fn new(name: u64, revision: [u8; REVISION_LEN], flags: u32) -> Self {
        Self {
            name,
            revision,
            flags,
            ver: 1,
            features: OffLen::default(),
            data_deps: OffLen::default(),
            inv_deps: OffLen::default(),
            op_deps: OffLen::default(),
            change_subs: [OffLen::default(); DS_COUNT],
            oper_subs: OffLen::default(),
            notif_subs: OffLen::default(),
            data_locks: std::array::from_fn(|_| ShmMutex::new()),
            replay_lock: ShmMutex::new(),
        }
    }

    /// The revision string, `None` when absent.
    pub fn revision_str(&self) -> Option<&str> {
        let nul = self.revision.iter().position(|&b| b == 0).unwrap_or(0);
        if nul == 0 {
            return None;
        }
        std::str::from_utf8(&self.revision[..nul]).ok()
    }
}

/// Kind of a data dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DepKind {
    /// A leafref/when/must reference into another module.
    Ref = 0,
    /// An instance-identifier dependency, resolved at validation time.
    InstId = 1,
}

impl DepKind {
    /// Convert from the raw stored value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ref),
            1 => Some(Self::InstId),
            _ => None,
        }
    }
}

/// One data dependency of a module.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DataDep {
    /// Raw [`DepKind`] tag.
    pub kind: u32,
    /// Padding to keep the record 8-byte aligned.
    pub _pad: u32,
    /// Arena offset of the referenced module's name.
    pub module: u64,
    /// Arena offset of the dependency xpath, 0 when absent.
    pub xpath: u64,
}

const_assert_eq!(std::mem::size_of::<DataDep>(), 24);

impl DataDep {
    /// Build a dependency record.
    pub fn new(kind: DepKind, module: u64, xpath: u64) -> Self {
        Self {
            kind: kind as u32,
            _pad: 0,
            module,
            xpath,
        }
    }
}

/// One operation (RPC/action) dependency of a module.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct OpDep {
    /// Arena offset of the operation xpath.
    pub xpath: u64,
    /// Input dependencies ([`DataDep`] array).
    pub in_deps: OffLen,
    /// Output dependencies ([`DataDep`] array).
    pub out_deps: OffLen,
}

const_assert_eq!(std::mem::size_of::<OpDep>(), 40);

/// One change subscription, keyed by `(xpath, priority)`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ChangeSub {
    /// Arena offset of the subscription xpath, 0 = whole module.
    pub xpath: u64,
    /// Callback priority.
    pub priority: u32,
    /// [`vela::msg::ChangeSubOpts`] bits.
    pub opts: u32,
    /// Event-pipe identifier of the subscriber.
    pub evpipe: u32,
    /// Padding to keep the record 8-byte aligned.
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<ChangeSub>(), 24);

impl ChangeSub {
    /// Build a change-subscription record.
    pub fn new(xpath: u64, priority: u32, opts: u32, evpipe: u32) -> Self {
        Self {
            xpath,
            priority,
            opts,
            evpipe,
            _pad: 0,
        }
    }
}

/// One operational-data subscription.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct OperSub {
    /// Arena offset of the provided xpath.
    pub xpath: u64,
    /// Event-pipe identifier of the subscriber.
    pub evpipe: u32,
    /// Padding to keep the record 8-byte aligned.
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<OperSub>(), 16);

impl OperSub {
    /// Build an operational-subscription record.
    pub fn new(xpath: u64, evpipe: u32) -> Self {
        Self {
            xpath,
            evpipe,
            _pad: 0,
        }
    }
}

/// One notification subscription.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NotifSub {
    /// Event-pipe identifier of the subscriber.
    pub evpipe: u32,
    /// Padding to keep the record 8-byte aligned.
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<NotifSub>(), 8);

impl NotifSub {
    /// Build a notification-subscription record.
    pub fn new(evpipe: u32) -> Self {
        Self { evpipe, _pad: 0 }
    }
}

/// One RPC/action known to the registry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RpcRecord {
    /// Arena offset of the operation path.
    pub op_path: u64,
    /// [`RpcSub`] array.
    pub subs: OffLen,
}

const_assert_eq!(std::mem::size_of::<RpcRecord>(), 24);

/// One RPC subscription.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RpcSub {
    /// Arena offset of the subscription xpath.
    pub xpath: u64,
    /// Callback priority.
    pub priority: u32,
    /// Event-pipe identifier of the subscriber.
    pub evpipe: u32,
}

const_assert_eq!(std::mem::size_of::<RpcSub>(), 16);

/// Held main-lock mode recorded per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeldLockKind {
    /// No main-lock hold.
    None = 0,
    /// Read hold; depth in [`HeldLock::rcount`].
    Read = 1,
    /// Write hold.
    Write = 2,
}

impl HeldLockKind {
    /// Convert from the raw stored value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Per-connection held-lock descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HeldLock {
    /// Raw [`HeldLockKind`] tag.
    pub mode: u32,
    /// Recursive read depth; 0 unless `mode == Read`.
    pub rcount: u32,
}

const_assert_eq!(std::mem::size_of::<HeldLock>(), 8);

impl HeldLock {
    /// An unheld descriptor.
    pub const NONE: Self = Self { mode: 0, rcount: 0 };
}

/// Arena-resident state of one attached process connection.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ConnState {
    /// Opaque owning-connection handle.
    pub conn: u64,
    /// Owning process.
    pub pid: u32,
    /// Padding to keep the record 8-byte aligned.
    pub _pad: u32,
    /// Event-pipe identifier array (`u32` elements).
    pub evpipes: OffLen,
    /// Held main-lock bookkeeping used by crash recovery.
    pub lock: HeldLock,
}

const_assert_eq!(std::mem::size_of::<ConnState>(), 40);

impl ConnState {
    /// Fresh state for a connection of the current process.
    pub fn new(conn: u64, pid: u32) -> Self {
        Self {
            conn,
            pid,
            _pad: 0,
            evpipes: OffLen::default(),
            lock: HeldLock::NONE,
        }
    }
}
