//! Application layer: the pieces that put the ports to work.
//!
//! - [`TaskQueue`]: what callers enqueue through
//! - [`TaskWorker`]: the claim/execute loop
//! - [`ReaperLoop`]: recovery of abandoned claims
//! - [`EngineBuilder`] / [`Engine`] / [`WorkerGroup`]: wiring, start-up checks, lifecycle
//! - [`WakeSignal`] / [`ShutdownSignal`]: coordination between them
//! - [`StatusReport`]: dashboard snapshot

pub mod builder;
pub mod queue;
pub mod reaper_loop;
pub mod signal;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, Engine, EngineBuilder, WorkerGroup};
pub use self::queue::{EnqueueOptions, EnqueueRequest, QueueError, TaskQueue};
pub use self::reaper_loop::{ReaperLoop, SweepReport};
pub use self::signal::{ShutdownListener, ShutdownSignal, WakeListener, WakeSignal};
pub use self::status::{FailureSummary, StatusReport};
pub use self::worker_loop::{RunOutcome, TaskWorker};
