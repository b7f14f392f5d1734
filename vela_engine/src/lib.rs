//! # vela engine runtime
//!
//! Process-local runtime of the configuration datastore engine: the
//! session manager binds incoming requests to sessions, the
//! request-processor pool drains them through worker threads, and the
//! dispatcher routes each request into the storage collaborator and
//! hands exactly one response back to the transport.
//!
//! The shared-memory registry lives in `vela_shm`; this crate consumes
//! it through the [`session::SessionIds`] seam and the locking API of
//! [`vela_shm::ShmConn`].

#![warn(clippy::all)]

pub mod dispatch;
pub mod error;
pub mod pool;
pub mod session;

pub use dispatch::{Datastore, MsgDispatcher, Transport};
pub use error::{EngineError, EngineResult};
pub use pool::{Dispatcher, RequestPool};
pub use session::{ConnKind, Connection, LocalIds, MsgBuf, Session, SessionIds, SessionManager};

/// Initialize tracing for engine processes
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
