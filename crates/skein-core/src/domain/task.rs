use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TaskId, TaskStatus};

/// Used when an enqueue does not say how many retries it wants.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Selects the handler for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub recurrence_rule: Option<String>,
    /// First task of the recurring series this row belongs to.
    pub original_task_id: Option<TaskId>,
    /// DTSTART of the series. Every occurrence carries the same value so COUNT and
    /// BY* defaults are evaluated against the series start, not the current row.
    pub recurrence_anchor: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_recurring(&self) -> bool {
        self.recurrence_rule.is_some()
    }

    /// Id that groups the series. One-shot tasks are their own series.
    pub fn series_id(&self) -> &TaskId {
        self.original_task_id.as_ref().unwrap_or(&self.task_id)
    }

    /// The row for the next occurrence of this series.
    pub fn successor(&self, task_id: TaskId, scheduled_at: DateTime<Utc>) -> NewTask {
        NewTask {
            task_id,
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            scheduled_at,
            max_retries: self.max_retries,
            recurrence_rule: self.recurrence_rule.clone(),
            original_task_id: Some(self.series_id().clone()),
            recurrence_anchor: Some(self.recurrence_anchor.unwrap_or(self.scheduled_at)),
        }
    }
}

/// Insert request for a fresh `pending` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub max_retries: u32,
    pub recurrence_rule: Option<String>,
    pub original_task_id: Option<TaskId>,
    pub recurrence_anchor: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(
        task_id: impl Into<TaskId>,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload,
            scheduled_at,
            max_retries: DEFAULT_MAX_RETRIES,
            recurrence_rule: None,
            original_task_id: None,
            recurrence_anchor: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn recurrence(mut self, rule: impl Into<String>) -> Self {
        self.recurrence_rule = Some(rule.into());
        self
    }

    pub fn original_task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.original_task_id = Some(id.into());
        self
    }

    /// Fills series defaults for recurring rows: the first row of a series is its own
    /// `original_task_id` and anchors the rule at its `scheduled_at`.
    pub fn normalized(mut self) -> Self {
        if self.recurrence_rule.is_some() {
            if self.original_task_id.is_none() {
                self.original_task_id = Some(self.task_id.clone());
            }
            if self.recurrence_anchor.is_none() {
                self.recurrence_anchor = Some(self.scheduled_at);
            }
        }
        self
    }

    /// Materializes the row as the store would insert it.
    pub fn into_task(self, created_at: DateTime<Utc>) -> Task {
        let new = self.normalized();
        Task {
            task_id: new.task_id,
            task_type: new.task_type,
            payload: new.payload,
            status: TaskStatus::Pending,
            scheduled_at: new.scheduled_at,
            created_at,
            started_at: None,
            completed_at: None,
            worker_id: None,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            recurrence_rule: new.recurrence_rule,
            original_task_id: new.original_task_id,
            recurrence_anchor: new.recurrence_anchor,
        }
    }
}
