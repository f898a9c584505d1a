//! Ports: the seams between the engine and the outside world.
//!
//! - `TaskStore`: durable task table (SQLite or in-memory in `impls`)
//! - `Clock`: source of "now"
//! - `IdGenerator`: task id generation

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{RequeuePolicy, StoreError, TaskStore, TaskTypeFilter};
