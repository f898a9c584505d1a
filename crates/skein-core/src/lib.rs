//! skein-core
//!
//! A durable task queue: callers enqueue work to run now, later, or on a recurrence
//! rule; workers claim due tasks from a shared store, run the registered handler, and
//! record the outcome (done, retry with backoff, failed, next occurrence). Rows survive
//! restarts, and the store's atomic claim keeps two workers from ever running the same
//! row at once, whether they live in one process or several.
//!
//! # Modules
//! - **domain**: task rows, status machine, handler errors, retry policy, outcome decisions
//! - **recurrence**: RRULE parser and next-occurrence expander
//! - **ports**: `TaskStore`, `Clock`, `IdGenerator`
//! - **impls**: SQLite and in-memory stores, bounded transient retry
//! - **typed**: typed payloads, handlers, and the handler registry
//! - **app**: caller facade, worker loop, reaper, engine wiring, signals, status
//! - **config**: TOML engine configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod recurrence;
pub mod typed;

pub use app::{
    EnqueueOptions, EnqueueRequest, Engine, EngineBuilder, RunOutcome, TaskQueue, TaskWorker,
    WorkerGroup,
};
pub use config::EngineConfig;
pub use domain::{HandlerError, NewTask, Task, TaskId, TaskStatus, TaskType};
pub use ports::{TaskStore, TaskTypeFilter};
pub use typed::{Handler, HandlerContext, HandlerRegistry, TaskPayload};
