//! ReaperLoop: recovery of claims abandoned by crashed workers.
//!
//! A worker that dies mid-handler leaves its row `running` forever; the claim path
//! never looks at such rows. The reaper finds rows that have been `running` for longer
//! than `stale_after` and treats each as a failed attempt ("worker vanished"), so it goes
//! through the same retry budget as a handler error.
//!
//! `stale_after` must exceed the longest legitimate handler run. A live but slow worker
//! whose row is reaped gets [`RunOutcome::Superseded`](super::RunOutcome::Superseded)
//! on its final write, and the task may run a second time.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::ShutdownListener;
use crate::domain::{Decider, Decision, HandlerError, truncate_error};
use crate::ports::{Clock, StoreError, TaskStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows put back to `pending` with a bumped retry count.
    pub requeued: u64,
    /// Rows whose budget was spent, now `failed`.
    pub failed: u64,
}

/// Periodic sweep over claims whose worker stopped reporting back.
///
/// # Flow
/// 1. `TaskStore::find_stale_running(now - stale_after)` lists the abandoned rows
/// 2. Each row goes through `Decider::on_failure` as a transient "claim abandoned" error
/// 3. `Retry` puts it back to `pending`; `Fail` closes it as `failed`
///
/// Every write is conditional on the row still being `running`, so a sweep racing the
/// original worker's final write changes nothing twice.
pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    interval: Duration,
    max_error_len: usize,
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            decider,
            clock,
            stale_after,
            interval,
            max_error_len: super::worker_loop::DEFAULT_MAX_ERROR_LEN,
        }
    }

    pub fn with_max_error_len(mut self, max_error_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self
    }

    /// One pass over the stale rows.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut report = SweepReport::default();
        for task in self.store.find_stale_running(cutoff).await? {
            let holder = task.worker_id.as_deref().unwrap_or("<unknown>");
            let abandoned = HandlerError::new(format!("claim abandoned by worker {holder}"));
            warn!(
                task_id = %task.task_id,
                task_type = %task.task_type,
                worker_id = holder,
                started_at = ?task.started_at,
                retry_count = task.retry_count,
                "reaping abandoned claim"
            );

            match self.decider.on_failure(&task, &abandoned, now) {
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
                        report.requeued += 1;
                    }
                }
                Decision::Fail { error } => {
                    let error = truncate_error(&error, self.max_error_len);
                    if self
                        .store
                        .mark_failed_permanently(&task.task_id, &error)
                        .await?
                    {
                        report.failed += 1;
                    }
                }
                other => {
                    debug!(task_id = %task.task_id, decision = ?other, "ignoring non-failure decision");
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: ShutdownListener) {
        info!(
            stale_after_secs = self.stale_after.as_secs(),
            interval_secs = self.interval.as_secs(),
            "reaper started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.sweep().await {
                Ok(report) if report != SweepReport::default() => {
                    info!(requeued = report.requeued, failed = report.failed, "reaper sweep done");
                }
                Ok(_) => debug!("reaper sweep found nothing"),
                Err(err) => error!(error = %err, "reaper sweep failed"),
            }
        }
        info!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, NewTask, RetryPolicy, TaskId, TaskStatus};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ManualClock, TaskTypeFilter};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryTaskStore>, ReaperLoop) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let reaper = ReaperLoop::new(
            store.clone(),
            Arc::new(DefaultDecider::new(RetryPolicy::new(Duration::from_secs(30)))),
            clock.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        (clock, store, reaper)
    }

    #[tokio::test]
    async fn fresh_claims_are_left_alone() {
        let (clock, store, reaper) = setup();
        store.enqueue(NewTask::new("t1", "echo", json!({}), t0())).await.unwrap();
        store.claim_next("w1", &TaskTypeFilter::Any).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        assert_eq!(reaper.sweep().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn stale_claims_are_retried_then_failed() {
        let (clock, store, reaper) = setup();
        store
            .enqueue(NewTask::new("t1", "echo", json!({}), t0()).max_retries(1))
            .await
            .unwrap();
        store.claim_next("crashed-1", &TaskTypeFilter::Any).await.unwrap();
        clock.advance(chrono::Duration::minutes(11));

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report, SweepReport { requeued: 1, failed: 0 });
        let row = store.get(&TaskId::new("t1")).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.last_error.unwrap().contains("crashed-1"));

        clock.advance(chrono::Duration::minutes(1));
        store.claim_next("crashed-2", &TaskTypeFilter::Any).await.unwrap().unwrap();
        clock.advance(chrono::Duration::minutes(11));

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report, SweepReport { requeued: 0, failed: 1 });
        let row = store.get(&TaskId::new("t1")).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert!(row.completed_at.is_some());
    }
}
