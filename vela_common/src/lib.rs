//! Shared definitions for the vela workspace.
//!
//! Single source of truth for the constants, configuration types and
//! message/value vocabulary used by `vela_shm` and `vela_engine`.
//! No other crate is allowed to duplicate these definitions.

pub mod config;
pub mod consts;
pub mod msg;

pub use config::{ConfigError, VelaConfig, load_config};
pub use msg::{
    ChangeSubOpts, Datastore, EditError, EditOpts, ErrorCode, ModuleFlags, MoveDirection, Msg,
    Request, Response, SchemaInfo, Value, ValueData,
};
