//! Error types for shared-memory operations

use thiserror::Error;
use vela::msg::ErrorCode;

/// Errors that can occur during shared-memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Memory allocation or mapping failure
    #[error("out of memory: {what}")]
    Nomem {
        /// What ran out of memory
        what: String,
    },

    /// Requested entry does not exist
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Entry already exists
    #[error("already exists: {what}")]
    Exists {
        /// What already exists
        what: String,
    },

    /// Lock acquisition timed out with a live holder
    #[error("lock timeout: {what}")]
    Timeout {
        /// Which lock timed out
        what: String,
    },

    /// An internal consistency invariant was violated
    #[error("internal error: {reason}")]
    Internal {
        /// What went wrong
        reason: String,
    },

    /// Operation not supported in the current state
    #[error("unsupported: {what}")]
    Unsupported {
        /// What was refused
        what: String,
    },

    /// Syscall failure
    #[error("{syscall}: {source}")]
    Sys {
        /// Name of the failed syscall
        syscall: &'static str,
        /// Source nix error
        #[source]
        source: nix::Error,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Repository initialization failed
    #[error("init failed: {reason}")]
    InitFailed {
        /// What failed during initialization
        reason: String,
    },
}

impl ShmError {
    /// Map to the result code surfaced in responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Nomem { .. } => ErrorCode::Nomem,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Exists { .. } | Self::Unsupported { .. } => ErrorCode::Unsupported,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::Sys { .. } | Self::Io { .. } => ErrorCode::Sys,
            Self::InitFailed { .. } => ErrorCode::InitFailed,
        }
    }
}

/// Result type for shared-memory operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_cover_the_taxonomy() {
        let err = ShmError::NotFound {
            what: "module m1".into(),
        };
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = ShmError::Timeout {
            what: "main lock".into(),
        };
        assert_eq!(err.code(), ErrorCode::Timeout);

        let err = ShmError::Internal {
            reason: "cursor mismatch".into(),
        };
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
