//! Typed handlers.
//!
//! Two layers: handlers are written against a concrete payload type
//! ([`TaskPayload`] + [`Handler<T, C>`]), and the worker dispatches through the
//! object-safe [`TaskHandler<C>`] keyed by task type. [`TypedHandler`] adapts the first
//! into the second and owns the JSON decode.
//!
//! `C` is the application context (chat client, HTTP client, embedding model, ...). It
//! is built once by the embedding application and handed to every invocation as an
//! `Arc<C>`; the engine never looks inside it.

pub mod context;
pub mod handler;
pub mod payload;
pub mod registry;

pub use self::context::HandlerContext;
pub use self::handler::{FnHandler, Handler, TaskHandler, TypedHandler};
pub use self::payload::TaskPayload;
pub use self::registry::{HandlerRegistry, RegistryError};
