//! Error types for the engine runtime

use thiserror::Error;
use vela::msg::ErrorCode;
use vela_shm::ShmError;

/// Errors surfaced by the session manager and request processor
#[derive(Error, Debug)]
pub enum EngineError {
    /// No session with the given id
    #[error("session {id} not found")]
    SessionNotFound {
        /// The session id
        id: u32,
    },

    /// No connection with the given file descriptor
    #[error("connection fd {fd} not found")]
    ConnectionNotFound {
        /// The file descriptor
        fd: i32,
    },

    /// A connection with the given file descriptor already exists
    #[error("connection fd {fd} already started")]
    ConnectionExists {
        /// The file descriptor
        fd: i32,
    },

    /// The request pool is shutting down
    #[error("request processor is stopped")]
    PoolStopped,

    /// Shared-memory layer failure
    #[error(transparent)]
    Shm(#[from] ShmError),
}

impl EngineError {
    /// Map to the result code surfaced in responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound { .. } | Self::ConnectionNotFound { .. } => ErrorCode::NotFound,
            Self::ConnectionExists { .. } => ErrorCode::Unsupported,
            Self::PoolStopped => ErrorCode::Internal,
            Self::Shm(e) => e.code(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
