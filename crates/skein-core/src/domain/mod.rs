//! Domain model: task rows, status machine, handler errors, retry and outcome policy.

pub mod decision;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, HandlerError, truncate_error};
pub use ids::TaskId;
pub use retry::RetryPolicy;
pub use state::{StatusCounts, TaskStatus, UnknownStatus};
pub use task::{DEFAULT_MAX_RETRIES, NewTask, Task, TaskType};
