use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskId, TaskType};

/// What a handler gets besides its payload.
pub struct HandlerContext<C = ()> {
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// 0 on the first attempt, then the number of retries so far.
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub worker_id: String,
    /// Series this row belongs to, for recurring tasks.
    pub original_task_id: Option<TaskId>,
    pub app: Arc<C>,
}

impl<C> HandlerContext<C> {
    pub fn for_task(task: &Task, worker_id: impl Into<String>, app: Arc<C>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            scheduled_at: task.scheduled_at,
            worker_id: worker_id.into(),
            original_task_id: task.original_task_id.clone(),
            app,
        }
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// True when a failure of this attempt will not be retried.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

// Manual impls: `C` itself need not be Clone or Debug.
impl<C> Clone for HandlerContext<C> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            scheduled_at: self.scheduled_at,
            worker_id: self.worker_id.clone(),
            original_task_id: self.original_task_id.clone(),
            app: Arc::clone(&self.app),
        }
    }
}

impl<C> fmt::Debug for HandlerContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("task_id", &self.task_id)
            .field("task_type", &self.task_type)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("scheduled_at", &self.scheduled_at)
            .field("worker_id", &self.worker_id)
            .field("original_task_id", &self.original_task_id)
            .finish_non_exhaustive()
    }
}
