//! Message and value vocabulary shared by the registry and the engine.
//!
//! The wire codec is a transport concern; these are the decoded,
//! in-memory forms the request processor dispatches on. Every request
//! operation has a matched response carrying a result code.

use bitflags::bitflags;

/// Result codes surfaced to clients and stored in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Operation succeeded.
    Ok = 0,
    /// Memory allocation or mapping failure.
    Nomem = 1,
    /// Requested item does not exist.
    NotFound = 2,
    /// Operation not supported.
    Unsupported = 3,
    /// Lock acquisition timed out.
    Timeout = 4,
    /// Internal consistency violation.
    Internal = 5,
    /// Syscall failure.
    Sys = 6,
    /// Repository initialization failed.
    InitFailed = 7,
}

impl ErrorCode {
    /// Convert from a raw `u32`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Nomem),
            2 => Some(Self::NotFound),
            3 => Some(Self::Unsupported),
            4 => Some(Self::Timeout),
            5 => Some(Self::Internal),
            6 => Some(Self::Sys),
            7 => Some(Self::InitFailed),
            _ => None,
        }
    }
}

/// Conventional datastore identifier.
///
/// Change subscriptions and data locks are kept per conventional
/// datastore; operational data has its own subscription table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Datastore {
    /// Startup configuration.
    Startup = 0,
    /// Running configuration.
    Running = 1,
    /// Candidate configuration.
    Candidate = 2,
}

impl Datastore {
    /// Convert from a raw `u8` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Startup),
            1 => Some(Self::Running),
            2 => Some(Self::Candidate),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-module flag bits stored in the module record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u32 {
        /// Notification replay is enabled for this module.
        const REPLAY_SUPPORT = 0x01;
    }
}

bitflags! {
    /// Options for `set-item` / `delete-item` requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EditOpts: u32 {
        /// Do not create missing ancestors.
        const NON_RECURSIVE = 0x01;
        /// Fail if the item already exists (set) or is absent (delete).
        const STRICT = 0x02;
        /// Keep the stored default flag on the edited node.
        const KEEP_DEFAULT = 0x04;
    }
}

bitflags! {
    /// Options carried by a change subscription.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChangeSubOpts: u32 {
        /// Notify only after the change is applied.
        const DONE_ONLY = 0x01;
        /// Subscriber does not participate in verification.
        const PASSIVE = 0x02;
        /// Subscriber may update the change before it is applied.
        const UPDATE = 0x04;
    }
}

/// Direction for a `move-item` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    /// Move before its preceding sibling.
    Up,
    /// Move after its following sibling.
    Down,
    /// Move to the first position.
    First,
    /// Move to the last position.
    Last,
}

/// A typed datastore value.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// Full path of the node.
    pub xpath: String,
    /// Whether the value is a schema default.
    pub is_default: bool,
    /// Typed payload.
    pub data: ValueData,
}

/// Typed payload of a datastore value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    /// Presence container or leaf of type `empty`.
    Empty,
    /// `boolean` leaf.
    Bool(bool),
    /// Signed integer leaf.
    Int64(i64),
    /// Unsigned integer leaf.
    Uint64(u64),
    /// `decimal64` leaf.
    Decimal(f64),
    /// String-typed leaf (string, enumeration, identityref, ...).
    String(String),
    /// `binary` leaf, already base64-decoded.
    Binary(Vec<u8>),
}

/// Schema descriptor returned by `list-schemas`.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaInfo {
    /// Module name.
    pub name: String,
    /// Module revision, if any.
    pub revision: Option<String>,
    /// Enabled features.
    pub features: Vec<String>,
    /// Whether notification replay is enabled.
    pub replay_support: bool,
}

/// One validation/commit error attached to a response.
#[derive(Debug, Clone, PartialEq)]
pub struct EditError {
    /// Path of the offending node.
    pub xpath: String,
    /// Human-readable message.
    pub message: String,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Enumerate known schemas.
    ListSchemas,
    /// Fetch a single item.
    GetItem {
        /// Path of the requested node.
        xpath: String,
    },
    /// Fetch a subtree or filtered set of items.
    GetItems {
        /// Path selecting the items.
        xpath: String,
        /// Descend into nested containers.
        recursive: bool,
        /// Skip this many matches.
        offset: Option<u32>,
        /// Return at most this many matches.
        limit: Option<u32>,
    },
    /// Create or replace an item.
    SetItem {
        /// Path of the edited node.
        xpath: String,
        /// New value; `None` for presence-only nodes.
        value: Option<Value>,
        /// Edit options.
        opts: EditOpts,
    },
    /// Delete an item.
    DeleteItem {
        /// Path of the deleted node.
        xpath: String,
        /// Edit options.
        opts: EditOpts,
    },
    /// Reorder a user-ordered list entry or leaf-list value.
    MoveItem {
        /// Path of the moved node.
        xpath: String,
        /// Where to move it.
        direction: MoveDirection,
    },
    /// Validate pending changes.
    Validate,
    /// Apply pending changes.
    Commit,
    /// Drop pending changes.
    DiscardChanges,
    /// An operation tag the engine does not recognize.
    Unknown {
        /// The raw operation tag.
        op: u32,
    },
}

/// A response produced by the request processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Response to [`Request::ListSchemas`].
    ListSchemas {
        /// Result code.
        code: ErrorCode,
        /// Known schemas on success.
        schemas: Vec<SchemaInfo>,
    },
    /// Response to [`Request::GetItem`].
    GetItem {
        /// Result code.
        code: ErrorCode,
        /// The value on success.
        value: Option<Value>,
    },
    /// Response to [`Request::GetItems`].
    GetItems {
        /// Result code.
        code: ErrorCode,
        /// Matched values on success.
        values: Vec<Value>,
    },
    /// Response to [`Request::SetItem`].
    SetItem {
        /// Result code.
        code: ErrorCode,
    },
    /// Response to [`Request::DeleteItem`].
    DeleteItem {
        /// Result code.
        code: ErrorCode,
    },
    /// Response to [`Request::MoveItem`].
    MoveItem {
        /// Result code.
        code: ErrorCode,
    },
    /// Response to [`Request::Validate`].
    Validate {
        /// Result code.
        code: ErrorCode,
        /// Per-node errors when validation fails.
        errors: Vec<EditError>,
    },
    /// Response to [`Request::Commit`].
    Commit {
        /// Result code.
        code: ErrorCode,
        /// Per-node errors when the commit is rejected.
        errors: Vec<EditError>,
    },
    /// Response to [`Request::DiscardChanges`].
    DiscardChanges {
        /// Result code.
        code: ErrorCode,
    },
    /// Response to an unrecognized operation tag.
    Unsupported {
        /// The raw operation tag.
        op: u32,
        /// Always [`ErrorCode::Unsupported`].
        code: ErrorCode,
    },
}

impl Response {
    /// The top-level result code of any response.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ListSchemas { code, .. }
            | Self::GetItem { code, .. }
            | Self::GetItems { code, .. }
            | Self::SetItem { code }
            | Self::DeleteItem { code }
            | Self::MoveItem { code }
            | Self::Validate { code, .. }
            | Self::Commit { code, .. }
            | Self::DiscardChanges { code }
            | Self::Unsupported { code, .. } => *code,
        }
    }
}

/// A message submitted to the request processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// A client request awaiting dispatch.
    Request(Request),
    /// A response in transit back to the transport.
    Response(Response),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrip() {
        for raw in 0..8u32 {
            let code = ErrorCode::from_u32(raw).unwrap();
            assert_eq!(code as u32, raw);
        }
        assert!(ErrorCode::from_u32(8).is_none());
        assert!(ErrorCode::from_u32(u32::MAX).is_none());
    }

    #[test]
    fn datastore_roundtrip() {
        for raw in 0..3u8 {
            let ds = Datastore::from_u8(raw).unwrap();
            assert_eq!(ds as u8, raw);
        }
        assert!(Datastore::from_u8(3).is_none());
    }

    #[test]
    fn response_code_accessor() {
        let resp = Response::SetItem {
            code: ErrorCode::Timeout,
        };
        assert_eq!(resp.code(), ErrorCode::Timeout);

        let resp = Response::Unsupported {
            op: 99,
            code: ErrorCode::Unsupported,
        };
        assert_eq!(resp.code(), ErrorCode::Unsupported);
    }

    #[test]
    fn flags_are_disjoint() {
        assert!(!ModuleFlags::REPLAY_SUPPORT.is_empty());
        assert_eq!(
            EditOpts::NON_RECURSIVE.bits() & EditOpts::STRICT.bits(),
            0
        );
        assert_eq!(
            ChangeSubOpts::DONE_ONLY.bits() & ChangeSubOpts::PASSIVE.bits(),
            0
        );
    }
}
