//! TaskStore port: the durable task table and every transition on it.
//!
//! The store is the only source of mutual exclusion in the engine. Workers in the same
//! process, or in different processes sharing one database, never coordinate through
//! in-memory locks; they rely on [`TaskStore::claim_next`] handing a row to exactly one
//! caller.
//!
//! Transition methods return `bool` instead of erroring when the row is not in the
//! expected state. A worker whose task was cancelled mid-handler gets `false` back
//! from its final write and moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ErrorKind, NewTask, StatusCounts, Task, TaskId, TaskType};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    /// Lock contention or a dropped connection. Worth retrying.
    #[error("storage busy: {0}")]
    Busy(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt row for task {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Busy(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Which task types a worker accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskTypeFilter {
    /// Any type. Rows without a registered handler are then failed by the worker.
    #[default]
    Any,
    /// Only these types. An empty list accepts nothing.
    Only(Vec<TaskType>),
}

impl TaskTypeFilter {
    pub fn only<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskType>,
    {
        TaskTypeFilter::Only(types.into_iter().map(Into::into).collect())
    }

    pub fn accepts(&self, task_type: &TaskType) -> bool {
        match self {
            TaskTypeFilter::Any => true,
            TaskTypeFilter::Only(types) => types.contains(task_type),
        }
    }
}

/// What a manual requeue of a `failed` row does to its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequeuePolicy {
    /// `retry_count` back to 0: the task gets its full budget again.
    #[default]
    ResetRetries,
    /// Keep `retry_count`. A task that had exhausted its budget fails on the next error.
    PreserveRetries,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a `pending` row. Fails with [`StoreError::DuplicateTask`] if the id exists.
    async fn enqueue(&self, task: NewTask) -> Result<(), StoreError>;

    /// Atomically moves the earliest due `pending` row of an accepted type to
    /// `running`, recording `worker_id` and `started_at`. `None` when nothing is due,
    /// including when another worker won the race.
    async fn claim_next(
        &self,
        worker_id: &str,
        accepted: &TaskTypeFilter,
    ) -> Result<Option<Task>, StoreError>;

    /// `running -> completed`.
    async fn mark_completed(&self, task_id: &TaskId) -> Result<bool, StoreError>;

    /// `running -> completed` plus the insert of the next occurrence, in one
    /// transaction. Nothing is inserted when the row is no longer `running`.
    async fn complete_with_successor(
        &self,
        task_id: &TaskId,
        successor: NewTask,
    ) -> Result<bool, StoreError>;

    /// `running -> failed`, recording `error`.
    async fn mark_failed_permanently(&self, task_id: &TaskId, error: &str)
    -> Result<bool, StoreError>;

    /// `running -> pending` at `next_scheduled_at` with `retry_count = new_retry_count`.
    /// Returns `false` when `new_retry_count` exceeds `max_retries`; the caller must
    /// fail the task instead.
    async fn reschedule_for_retry(
        &self,
        task_id: &TaskId,
        next_scheduled_at: DateTime<Utc>,
        new_retry_count: u32,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// `pending | running -> cancelled`.
    async fn cancel(&self, task_id: &TaskId) -> Result<bool, StoreError>;

    /// Cancels every non-terminal row of a series. Returns how many rows changed.
    async fn cancel_series(&self, original_task_id: &TaskId) -> Result<u64, StoreError>;

    /// `failed -> pending` at `scheduled_at`.
    async fn requeue_failed(
        &self,
        task_id: &TaskId,
        policy: RequeuePolicy,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Most recently created first.
    async fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// `failed` rows, most recently failed first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Rows of a series, oldest first.
    async fn list_series(&self, original_task_id: &TaskId) -> Result<Vec<Task>, StoreError>;

    /// `running` rows claimed before `started_before`.
    async fn find_stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_is_transient() {
        assert!(StoreError::Busy("database is locked".into()).is_transient());
        assert!(!StoreError::DuplicateTask(TaskId::new("t1")).is_transient());
        assert!(!StoreError::Backend("disk I/O error".into()).is_transient());
    }

    #[test]
    fn filter_accepts() {
        let only = TaskTypeFilter::only(["echo", "digest"]);
        assert!(only.accepts(&TaskType::new("echo")));
        assert!(!only.accepts(&TaskType::new("index")));
        assert!(TaskTypeFilter::Any.accepts(&TaskType::new("index")));
        assert!(!TaskTypeFilter::Only(vec![]).accepts(&TaskType::new("echo")));
    }
}
