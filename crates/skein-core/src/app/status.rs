//! StatusReport: a snapshot for dashboards and the CLI.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{StatusCounts, Task, TaskId, TaskStatus, TaskType};
use crate::ports::{StoreError, TaskStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Task> for FailureSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            failed_at: task.completed_at,
            last_error: task.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub counts: StatusCounts,
    /// Most recently failed first.
    pub recent_failures: Vec<FailureSummary>,
}

impl StatusReport {
    pub async fn collect(
        store: &dyn TaskStore,
        now: DateTime<Utc>,
        max_failures: usize,
    ) -> Result<Self, StoreError> {
        let counts = store.counts_by_status().await?;
        let recent_failures = if counts.failed == 0 {
            Vec::new()
        } else {
            store
                .list_failed(max_failures)
                .await?
                .iter()
                .map(FailureSummary::from)
                .collect()
        };
        Ok(Self {
            generated_at: now,
            counts,
            recent_failures,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "as of {}", self.generated_at.to_rfc3339())?;
        for status in TaskStatus::ALL {
            writeln!(f, "  {:<10} {}", status.as_str(), self.counts.get(status))?;
        }
        writeln!(f, "  {:<10} {}", "total", self.counts.total())?;
        if !self.recent_failures.is_empty() {
            writeln!(f, "recent failures:")?;
            for failure in &self.recent_failures {
                writeln!(
                    f,
                    "  {} [{}] retries {}/{}: {}",
                    failure.task_id,
                    failure.task_type,
                    failure.retry_count,
                    failure.max_retries,
                    failure.last_error.as_deref().unwrap_or("-")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Clock, ManualClock, TaskTypeFilter};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn collects_counts_and_failures() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let store = InMemoryTaskStore::new(Arc::new(ManualClock::new(now)));
        store.enqueue(NewTask::new("ok", "echo", json!({}), now)).await.unwrap();
        store.enqueue(NewTask::new("bad", "echo", json!({}), now)).await.unwrap();

        let claimed = store.claim_next("w1", &TaskTypeFilter::Any).await.unwrap().unwrap();
        store.mark_failed_permanently(&claimed.task_id, "boom").await.unwrap();

        let report = StatusReport::collect(&store, now, 10).await.unwrap();
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.pending, 1);
        assert_eq!(report.recent_failures.len(), 1);
        assert_eq!(report.recent_failures[0].task_id, claimed.task_id);
        assert_eq!(report.recent_failures[0].last_error.as_deref(), Some("boom"));

        let text = report.to_string();
        assert!(text.contains("failed     1"));
        assert!(text.contains("boom"));
    }

    #[tokio::test]
    async fn failures_older_than_recent_rows_are_still_listed() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()));
        let store = InMemoryTaskStore::new(clock.clone());
        store.enqueue(NewTask::new("old", "echo", json!({}), clock.now())).await.unwrap();
        let claimed = store.claim_next("w1", &TaskTypeFilter::Any).await.unwrap().unwrap();
        store.mark_failed_permanently(&claimed.task_id, "long ago").await.unwrap();

        clock.advance(chrono::Duration::minutes(1));
        for n in 0..600 {
            store
                .enqueue(NewTask::new(format!("new-{n}"), "echo", json!({}), clock.now()))
                .await
                .unwrap();
        }

        let report = StatusReport::collect(&store, clock.now(), 5).await.unwrap();
        assert_eq!(report.counts.pending, 600);
        assert_eq!(report.recent_failures.len(), 1);
        assert_eq!(report.recent_failures[0].task_id, TaskId::new("old"));
    }
}
