//! TaskWorker: the claim → handle → decide → record loop.
//!
//! One worker runs one handler at a time. Concurrency comes from running several
//! workers, in this process or others, against the same store; the store's atomic claim
//! is the only thing keeping them apart.
//!
//! Every final write (`mark_completed`, `reschedule_for_retry`, ...) is conditional on
//! the row still being `running`. A row cancelled while its handler ran yields
//! [`RunOutcome::Superseded`] and is left alone.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{ShutdownListener, WakeSignal};
use crate::domain::{Decider, Decision, DefaultDecider, HandlerError, Task, TaskId, truncate_error};
use crate::ports::{
    Clock, IdGenerator, StoreError, SystemClock, TaskStore, TaskTypeFilter, UlidGenerator,
};
use crate::typed::{HandlerContext, HandlerRegistry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ERROR_LEN: usize = 4000;

/// What one claimed task ended up as.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Completed, and the next occurrence was inserted.
    Recurred {
        next_task_id: TaskId,
        next_at: DateTime<Utc>,
    },
    RetryScheduled {
        retry_count: u32,
        at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
    /// The row left `running` while the handler ran (cancelled, or swept); our final
    /// write was a no-op.
    Superseded,
}

/// One claim loop.
///
/// # Flow
/// 1. `claim_next` the earliest due row this worker's filter accepts
/// 2. Look up the handler and run it on its own tokio task
/// 3. Ask the `Decider` what the result means
/// 4. Apply the decision with a write conditional on `running`
///
/// When nothing is due the worker sleeps until a wake pulse or its poll interval
/// elapses. Shutdown interrupts the sleep, never a running handler.
///
/// # Example
/// ```ignore
/// let worker = TaskWorker::new("default-0", store, Arc::new(registry), Arc::new(app))
///     .with_filter(TaskTypeFilter::only(["reminders.send"]))
///     .with_wake(queue.wake_signal().clone());
/// tokio::spawn(async move { worker.run(shutdown.listener()).await });
/// ```
pub struct TaskWorker<C = ()> {
    worker_id: String,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry<C>>,
    app: Arc<C>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    wake: WakeSignal,
    filter: TaskTypeFilter,
    poll_interval: Duration,
    max_error_len: usize,
}

impl<C: Send + Sync + 'static> TaskWorker<C> {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry<C>>,
        app: Arc<C>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            registry,
            app,
            decider: Arc::new(DefaultDecider::default()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            wake: WakeSignal::new(),
            filter: TaskTypeFilter::Any,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_error_len: DEFAULT_MAX_ERROR_LEN,
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_wake(mut self, wake: WakeSignal) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_filter(mut self, filter: TaskTypeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_error_len(mut self, max_error_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs until `shutdown` fires. A task already in flight is finished first.
    pub async fn run(&self, mut shutdown: ShutdownListener) {
        info!(worker_id = %self.worker_id, filter = ?self.filter, "worker started");
        // Subscribed before the first drain, so a pulse sent during it is not lost.
        let mut wake = self.wake.subscribe();
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            match self.run_once().await {
                // Drain everything that is due before sleeping.
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    error!(worker_id = %self.worker_id, error = %err, "store error in worker loop");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = wake.wait() => {
                    debug!(worker_id = %self.worker_id, "woken by wake signal");
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    debug!(worker_id = %self.worker_id, "woke from poll timeout");
                }
            }
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Claims and runs at most one task. `None` when nothing was due.
    pub async fn run_once(&self) -> Result<Option<RunOutcome>, StoreError> {
        let Some(task) = self.store.claim_next(&self.worker_id, &self.filter).await? else {
            return Ok(None);
        };
        info!(
            worker_id = %self.worker_id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            retry_count = task.retry_count,
            "claimed task"
        );
        self.execute(task).await.map(Some)
    }

    async fn execute(&self, task: Task) -> Result<RunOutcome, StoreError> {
        let Some(handler) = self.registry.get(&task.task_type) else {
            let reason = format!("no handler registered for task type '{}'", task.task_type);
            return self.fail(&task, reason).await;
        };

        let ctx = HandlerContext::for_task(&task, self.worker_id.clone(), Arc::clone(&self.app));
        let payload = task.payload.clone();
        // Own tokio task, so a panicking handler surfaces as a JoinError, not a dead worker.
        let result = match tokio::spawn(async move { handler.handle(ctx, payload).await }).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(join.into_panic())
            ))),
            Err(join) => Err(HandlerError::new(format!("handler task aborted: {join}"))),
        };

        let now = self.clock.now();
        let decision = match &result {
            Ok(()) => self.decider.on_success(&task, now),
            Err(err) => {
                warn!(
                    worker_id = %self.worker_id,
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    retry_count = task.retry_count,
                    kind = %err.kind(),
                    error = %err,
                    "handler failed"
                );
                self.decider.on_failure(&task, err, now)
            }
        };
        self.apply(&task, decision).await
    }

    async fn apply(&self, task: &Task, decision: Decision) -> Result<RunOutcome, StoreError> {
        let outcome = match decision {
            Decision::Complete => {
                if self.store.mark_completed(&task.task_id).await? {
                    RunOutcome::Completed
                } else {
                    RunOutcome::Superseded
                }
            }
            Decision::Recur { next_at } => {
                let next_task_id = self.ids.generate_task_id();
                let successor = task.successor(next_task_id.clone(), next_at);
                if self.store.complete_with_successor(&task.task_id, successor).await? {
                    RunOutcome::Recurred {
                        next_task_id,
                        next_at,
                    }
                } else {
                    RunOutcome::Superseded
                }
            }
            Decision::Retry {
                retry_count,
                next_at,
                error,
                ..
            } => {
                let error = truncate_error(&error, self.max_error_len);
                if self
                    .store
                    .reschedule_for_retry(&task.task_id, next_at, retry_count, &error)
                    .await?
                {
                    RunOutcome::RetryScheduled {
                        retry_count,
                        at: next_at,
                    }
                } else {
                    // Either the row is gone from `running` or the budget is spent
                    // after all; failing it is a no-op in the first case.
                    return self.fail(task, error).await;
                }
            }
            Decision::Fail { error } => return self.fail(task, error).await,
        };
        self.log_outcome(task, &outcome);
        Ok(outcome)
    }

    async fn fail(&self, task: &Task, reason: String) -> Result<RunOutcome, StoreError> {
        let reason = truncate_error(&reason, self.max_error_len);
        let outcome = if self
            .store
            .mark_failed_permanently(&task.task_id, &reason)
            .await?
        {
            RunOutcome::Failed { reason }
        } else {
            RunOutcome::Superseded
        };
        self.log_outcome(task, &outcome);
        Ok(outcome)
    }

    fn log_outcome(&self, task: &Task, outcome: &RunOutcome) {
        let worker_id = self.worker_id.as_str();
        let task_id = task.task_id.as_str();
        match outcome {
            RunOutcome::Completed => info!(worker_id, task_id, "task completed"),
            RunOutcome::Recurred {
                next_task_id,
                next_at,
            } => info!(
                worker_id,
                task_id,
                next_task_id = %next_task_id,
                next_at = %next_at,
                "task completed, next occurrence scheduled"
            ),
            RunOutcome::RetryScheduled { retry_count, at } => info!(
                worker_id,
                task_id,
                retry_count,
                at = %at,
                "task rescheduled for retry"
            ),
            RunOutcome::Failed { reason } => warn!(worker_id, task_id, reason = %reason, "task failed"),
            RunOutcome::Superseded => warn!(
                worker_id,
                task_id,
                "task left running state during execution; result dropped"
            ),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
