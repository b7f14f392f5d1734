//! Session and connection bookkeeping.
//!
//! The manager owns the process-local session records, draws their ids
//! from the shared-memory monotonic counter through the [`SessionIds`]
//! seam, and indexes sessions by id and connections by file descriptor.
//! One coarse mutex guards both indices; the call rate does not justify
//! anything finer.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};

/// Which side of the transport a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// A client connected to this engine.
    Client,
    /// This engine connected out to a peer.
    Server,
}

/// Growable byte buffer with a write cursor, one pair per connection.
#[derive(Debug, Default)]
pub struct MsgBuf {
    data: Vec<u8>,
    pos: usize,
}

impl MsgBuf {
    /// Append bytes at the cursor.
    pub fn write(&mut self, bytes: &[u8]) {
        if self.pos + bytes.len() > self.data.len() {
            self.data.resize(self.pos + bytes.len(), 0);
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Reset the cursor, keeping the allocation.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Current cursor position.
    pub fn pos(&self) -> usize {
        self.pos
    }
}

/// Source of unique session ids.
///
/// The engine draws ids from the main-region monotonic counter so they
/// are unique across every process attached to the repository.
pub trait SessionIds: Send + Sync {
    /// Draw the next unique id.
    fn next_session_id(&self) -> u32;
}

impl SessionIds for Mutex<vela_shm::ShmConn> {
    fn next_session_id(&self) -> u32 {
        self.lock().store().next_session_id()
    }
}

/// Process-local id source for standalone use and tests.
#[derive(Debug)]
pub struct LocalIds(AtomicU32);

impl Default for LocalIds {
    fn default() -> Self {
        Self(AtomicU32::new(1))
    }
}

impl SessionIds for LocalIds {
    fn next_session_id(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// One client session bound to a connection.
#[derive(Debug)]
pub struct Session {
    id: u32,
    conn_fd: RawFd,
    ruid: u32,
    euid: u32,
    inflight: AtomicU32,
    stop_requested: AtomicBool,
    cleaned: AtomicBool,
}

impl Session {
    fn new(id: u32, conn_fd: RawFd, ruid: u32, euid: u32) -> Self {
        Self {
            id,
            conn_fd,
            ruid,
            euid,
            inflight: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        }
    }

    /// Unique session id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// File descriptor of the owning connection.
    pub fn conn_fd(&self) -> RawFd {
        self.conn_fd
    }

    /// Real user id of the client.
    pub fn ruid(&self) -> u32 {
        self.ruid
    }

    /// Effective user id of the client.
    pub fn euid(&self) -> u32 {
        self.euid
    }

    /// Messages currently queued or dispatching for this session.
    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Whether deferred teardown was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_msg(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one in-flight message; `true` when this was the last one
    /// and teardown was requested.
    pub(crate) fn finish_msg(&self) -> bool {
        let prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "in-flight counter underflow");
        prev == 1 && self.stop_requested()
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Claim the exactly-once right to run cleanup.
    pub(crate) fn claim_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::SeqCst)
    }
}

/// One transport connection and its attached sessions.
#[derive(Debug)]
pub struct Connection {
    kind: ConnKind,
    fd: RawFd,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Inbound message bytes being assembled.
    pub inbuf: Mutex<MsgBuf>,
    /// Outbound message bytes being flushed.
    pub outbuf: Mutex<MsgBuf>,
}

impl Connection {
    /// Transport kind.
    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    /// Underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Snapshot of the attached sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<u32, Arc<Session>>,
    by_fd: HashMap<RawFd, Arc<Connection>>,
}

/// Owner of all session and connection records of this process.
pub struct SessionManager {
    ids: Arc<dyn SessionIds>,
    inner: Mutex<Indexes>,
}

impl SessionManager {
    /// Create a manager drawing ids from `ids`.
    pub fn new(ids: Arc<dyn SessionIds>) -> Self {
        Self {
            ids,
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Create the context of a newly accepted connection.
    pub fn connection_start(&self, kind: ConnKind, fd: RawFd) -> EngineResult<Arc<Connection>> {
        let mut inner = self.inner.lock();
        if inner.by_fd.contains_key(&fd) {
            return Err(EngineError::ConnectionExists { fd });
        }
        let conn = Arc::new(Connection {
            kind,
            fd,
            sessions: Mutex::new(Vec::new()),
            inbuf: Mutex::new(MsgBuf::default()),
            outbuf: Mutex::new(MsgBuf::default()),
        });
        inner.by_fd.insert(fd, Arc::clone(&conn));
        tracing::debug!(fd, ?kind, "connection started");
        Ok(conn)
    }

    /// Destroy a connection context, dropping all its sessions.
    pub fn connection_stop(&self, fd: RawFd) -> EngineResult<()> {
        let conn = {
            let mut inner = self.inner.lock();
            let conn = inner
                .by_fd
                .remove(&fd)
                .ok_or(EngineError::ConnectionNotFound { fd })?;
            for session in conn.sessions.lock().iter() {
                inner.by_id.remove(&session.id());
            }
            conn
        };
        conn.sessions.lock().clear();
        tracing::debug!(fd, "connection stopped");
        Ok(())
    }

    /// Allocate a session on `conn` with the given user identities.
    pub fn session_create(&self, conn: &Arc<Connection>, ruid: u32, euid: u32) -> Arc<Session> {
        let id = self.ids.next_session_id();
        let session = Arc::new(Session::new(id, conn.fd(), ruid, euid));
        conn.sessions.lock().push(Arc::clone(&session));
        self.inner.lock().by_id.insert(id, Arc::clone(&session));
        tracing::debug!(id, fd = conn.fd(), "session created");
        session
    }

    /// Remove a session from the indices and its connection.
    pub fn session_drop(&self, id: u32) -> EngineResult<()> {
        let session = {
            let mut inner = self.inner.lock();
            let session = inner
                .by_id
                .remove(&id)
                .ok_or(EngineError::SessionNotFound { id })?;
            if let Some(conn) = inner.by_fd.get(&session.conn_fd()) {
                conn.sessions.lock().retain(|s| s.id() != id);
            }
            session
        };
        tracing::debug!(id = session.id(), "session dropped");
        Ok(())
    }

    /// Look up a session by id.
    pub fn session_find_id(&self, id: u32) -> EngineResult<Arc<Session>> {
        self.inner
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound { id })
    }

    /// Look up a connection by file descriptor.
    pub fn connection_find_fd(&self, fd: RawFd) -> EngineResult<Arc<Connection>> {
        self.inner
            .lock()
            .by_fd
            .get(&fd)
            .cloned()
            .ok_or(EngineError::ConnectionNotFound { fd })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(LocalIds::default()))
    }

    #[test]
    fn session_ids_are_unique_and_indexed() {
        let mgr = manager();
        let conn = mgr.connection_start(ConnKind::Client, 5).unwrap();
        let a = mgr.session_create(&conn, 1000, 1000);
        let b = mgr.session_create(&conn, 1000, 0);
        assert_ne!(a.id(), b.id());

        assert_eq!(mgr.session_find_id(a.id()).unwrap().id(), a.id());
        assert_eq!(mgr.connection_find_fd(5).unwrap().fd(), 5);
        assert_eq!(conn.sessions().len(), 2);

        mgr.session_drop(a.id()).unwrap();
        assert!(matches!(
            mgr.session_find_id(a.id()),
            Err(EngineError::SessionNotFound { .. })
        ));
        assert_eq!(conn.sessions().len(), 1);
    }

    #[test]
    fn connection_stop_cascades() {
        let mgr = manager();
        let conn = mgr.connection_start(ConnKind::Client, 9).unwrap();
        let s = mgr.session_create(&conn, 0, 0);
        mgr.connection_stop(9).unwrap();

        assert!(mgr.session_find_id(s.id()).is_err());
        assert!(mgr.connection_find_fd(9).is_err());
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn duplicate_fd_is_refused() {
        let mgr = manager();
        mgr.connection_start(ConnKind::Client, 3).unwrap();
        assert!(matches!(
            mgr.connection_start(ConnKind::Server, 3),
            Err(EngineError::ConnectionExists { .. })
        ));
    }

    #[test]
    fn msg_buf_tracks_cursor() {
        let mut buf = MsgBuf::default();
        buf.write(b"abc");
        buf.write(b"de");
        assert_eq!(buf.written(), b"abcde");
        assert_eq!(buf.pos(), 5);
        buf.reset();
        assert_eq!(buf.pos(), 0);
        buf.write(b"xy");
        assert_eq!(buf.written(), b"xy");
    }
}
