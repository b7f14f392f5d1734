//! Message dispatch against the storage collaborator.
//!
//! Every dequeued request is handled by exactly one typed arm: invoke
//! the [`Datastore`] call, fold the outcome into the matched response
//! with its result code, hand it to the [`Transport`], drop the
//! request. Unknown operation tags yield `Unsupported`.

use std::sync::Arc;

use vela::msg::{
    EditError, EditOpts, ErrorCode, MoveDirection, Msg, Request, Response, SchemaInfo, Value,
};

use crate::pool::Dispatcher;
use crate::session::{Session, SessionManager};

/// The datastore collaborator the engine dispatches into.
///
/// Implementations own the storage format and validation semantics;
/// the engine only routes requests and shapes responses.
pub trait Datastore: Send + Sync {
    /// Enumerate known schemas.
    fn list_schemas(&self, session: &Session) -> Result<Vec<SchemaInfo>, ErrorCode>;

    /// Fetch one item.
    fn get_item(&self, session: &Session, xpath: &str) -> Result<Value, ErrorCode>;

    /// Fetch a set of items.
    fn get_items(
        &self,
        session: &Session,
        xpath: &str,
        recursive: bool,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, ErrorCode>;

    /// Create or replace an item.
    fn set_item(
        &self,
        session: &Session,
        xpath: &str,
        value: Option<&Value>,
        opts: EditOpts,
    ) -> Result<(), ErrorCode>;

    /// Delete an item.
    fn delete_item(&self, session: &Session, xpath: &str, opts: EditOpts)
    -> Result<(), ErrorCode>;

    /// Reorder a user-ordered entry.
    fn move_item(
        &self,
        session: &Session,
        xpath: &str,
        direction: MoveDirection,
    ) -> Result<(), ErrorCode>;

    /// Validate pending changes; failures carry per-node errors.
    fn validate(&self, session: &Session) -> Result<(), (ErrorCode, Vec<EditError>)>;

    /// Apply pending changes; rejections carry per-node errors.
    fn commit(&self, session: &Session) -> Result<(), (ErrorCode, Vec<EditError>)>;

    /// Drop pending changes.
    fn discard_changes(&self, session: &Session) -> Result<(), ErrorCode>;
}

/// The message-send primitive of the transport.
pub trait Transport: Send + Sync {
    /// Deliver one response to the session's connection.
    fn send(&self, session: &Session, response: Response) -> Result<(), ErrorCode>;
}

/// Routes requests from the pool into the collaborators.
pub struct MsgDispatcher {
    sessions: Arc<SessionManager>,
    store: Arc<dyn Datastore>,
    transport: Arc<dyn Transport>,
}

impl MsgDispatcher {
    /// Wire the dispatcher to its collaborators.
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn Datastore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            sessions,
            store,
            transport,
        }
    }

    fn handle(&self, session: &Session, request: Request) -> Response {
        match request {
            Request::ListSchemas => match self.store.list_schemas(session) {
                Ok(schemas) => Response::ListSchemas {
                    code: ErrorCode::Ok,
                    schemas,
                },
                Err(code) => Response::ListSchemas {
                    code,
                    schemas: Vec::new(),
                },
            },
            Request::GetItem { xpath } => match self.store.get_item(session, &xpath) {
                Ok(value) => Response::GetItem {
                    code: ErrorCode::Ok,
                    value: Some(value),
                },
                Err(code) => Response::GetItem { code, value: None },
            },
            Request::GetItems {
                xpath,
                recursive,
                offset,
                limit,
            } => match self.store.get_items(session, &xpath, recursive, offset, limit) {
                Ok(values) => Response::GetItems {
                    code: ErrorCode::Ok,
                    values,
                },
                Err(code) => Response::GetItems {
                    code,
                    values: Vec::new(),
                },
            },
            Request::SetItem { xpath, value, opts } => {
                let code = match self.store.set_item(session, &xpath, value.as_ref(), opts) {
                    Ok(()) => ErrorCode::Ok,
                    Err(code) => code,
                };
                Response::SetItem { code }
            }
            Request::DeleteItem { xpath, opts } => {
                let code = match self.store.delete_item(session, &xpath, opts) {
                    Ok(()) => ErrorCode::Ok,
                    Err(code) => code,
                };
                Response::DeleteItem { code }
            }
            Request::MoveItem { xpath, direction } => {
                let code = match self.store.move_item(session, &xpath, direction) {
                    Ok(()) => ErrorCode::Ok,
                    Err(code) => code,
                };
                Response::MoveItem { code }
            }
            Request::Validate => match self.store.validate(session) {
                Ok(()) => Response::Validate {
                    code: ErrorCode::Ok,
                    errors: Vec::new(),
                },
                Err((code, errors)) => Response::Validate { code, errors },
            },
            Request::Commit => match self.store.commit(session) {
                Ok(()) => Response::Commit {
                    code: ErrorCode::Ok,
                    errors: Vec::new(),
                },
                Err((code, errors)) => Response::Commit { code, errors },
            },
            Request::DiscardChanges => {
                let code = match self.store.discard_changes(session) {
                    Ok(()) => ErrorCode::Ok,
                    Err(code) => code,
                };
                Response::DiscardChanges { code }
            }
            Request::Unknown { op } => {
                tracing::warn!(op, session = session.id(), "unsupported operation");
                Response::Unsupported {
                    op,
                    code: ErrorCode::Unsupported,
                }
            }
        }
    }
}

impl Dispatcher for MsgDispatcher {
    fn dispatch(&self, session: &Arc<Session>, msg: Msg) {
        let request = match msg {
            Msg::Request(request) => request,
            Msg::Response(_) => {
                tracing::warn!(
                    session = session.id(),
                    "response message reached the request processor"
                );
                return;
            }
        };
        let response = self.handle(session, request);
        if let Err(code) = self.transport.send(session, response) {
            tracing::warn!(
                session = session.id(),
                code = code as u32,
                "failed to send response"
            );
        }
    }

    fn session_cleanup(&self, session: &Arc<Session>) {
        if let Err(e) = self.sessions.session_drop(session.id()) {
            tracing::debug!(session = session.id(), error = %e, "cleanup of unknown session");
        }
    }
}
