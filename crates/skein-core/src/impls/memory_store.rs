//! In-memory task store.
//!
//! Same contract as the SQLite store, minus durability. Useful for tests and for
//! embedding the engine where losing queued work on restart is acceptable. A single
//! async mutex around the whole table makes every operation atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{NewTask, StatusCounts, Task, TaskId, TaskStatus};
use crate::ports::{Clock, RequeuePolicy, StoreError, TaskStore, TaskTypeFilter};

struct Entry {
    task: Task,
    /// Insertion order, the tie-breaker where SQLite would use rowid.
    seq: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<TaskId, Entry>,
    next_seq: u64,
}

impl MemoryState {
    fn insert(&mut self, task: Task) -> Result<(), StoreError> {
        if self.entries.contains_key(&task.task_id) {
            return Err(StoreError::DuplicateTask(task.task_id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(task.task_id.clone(), Entry { task, seq });
        Ok(())
    }

    fn running_mut(&mut self, task_id: &TaskId) -> Option<&mut Task> {
        self.entries
            .get_mut(task_id)
            .map(|entry| &mut entry.task)
            .filter(|task| task.status == TaskStatus::Running)
    }

    fn sorted<'a>(&'a self, filter: impl Fn(&Task) -> bool) -> Vec<&'a Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().filter(|e| filter(&e.task)).collect();
        entries.sort_by_key(|e| (e.task.created_at, e.seq));
        entries
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<(), StoreError> {
        let created_at = self.clock.now();
        self.state.lock().await.insert(task.into_task(created_at))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        accepted: &TaskTypeFilter,
    ) -> Result<Option<Task>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let next = state
            .entries
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Pending
                    && e.task.scheduled_at <= now
                    && accepted.accepts(&e.task.task_type)
            })
            .min_by_key(|e| (e.task.scheduled_at, e.task.created_at, e.seq))
            .map(|e| e.task.task_id.clone());

        let Some(task_id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&task_id) else {
            return Ok(None);
        };
        entry.task.status = TaskStatus::Running;
        entry.task.worker_id = Some(worker_id.to_string());
        entry.task.started_at = Some(now);
        Ok(Some(entry.task.clone()))
    }

    async fn mark_completed(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.running_mut(task_id) else {
            return Ok(false);
        };
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        Ok(true)
    }

    async fn complete_with_successor(
        &self,
        task_id: &TaskId,
        successor: NewTask,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.running_mut(task_id).is_none() {
            return Ok(false);
        }
        // Insert first: on a duplicate id nothing has changed yet.
        state.insert(successor.into_task(now))?;
        if let Some(task) = state.running_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn mark_failed_permanently(
        &self,
        task_id: &TaskId,
        error: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.running_mut(task_id) else {
            return Ok(false);
        };
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn reschedule_for_retry(
        &self,
        task_id: &TaskId,
        next_scheduled_at: DateTime<Utc>,
        new_retry_count: u32,
        error: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.running_mut(task_id) else {
            return Ok(false);
        };
        if new_retry_count > task.max_retries {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.scheduled_at = next_scheduled_at;
        task.retry_count = new_retry_count;
        task.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.entries.get_mut(task_id) {
            Some(entry) if entry.task.status.can_transition_to(TaskStatus::Cancelled) => {
                entry.task.status = TaskStatus::Cancelled;
                entry.task.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_series(&self, original_task_id: &TaskId) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut cancelled = 0;
        for entry in state.entries.values_mut() {
            let in_series = entry.task.series_id() == original_task_id;
            if in_series && entry.task.status.can_transition_to(TaskStatus::Cancelled) {
                entry.task.status = TaskStatus::Cancelled;
                entry.task.completed_at = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn requeue_failed(
        &self,
        task_id: &TaskId,
        policy: RequeuePolicy,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(task_id) else {
            return Ok(false);
        };
        let task = &mut entry.task;
        if task.status != TaskStatus::Failed {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.scheduled_at = scheduled_at;
        task.started_at = None;
        task.completed_at = None;
        if policy == RequeuePolicy::ResetRetries {
            task.retry_count = 0;
        }
        Ok(true)
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(task_id).map(|e| e.task.clone()))
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted(|_| true)
            .into_iter()
            .rev()
            .take(limit)
            .map(|e| e.task.clone())
            .collect())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut failed = state.sorted(|task| task.status == TaskStatus::Failed);
        failed.sort_by_key(|e| std::cmp::Reverse((e.task.completed_at, e.seq)));
        Ok(failed.into_iter().take(limit).map(|e| e.task.clone()).collect())
    }

    async fn list_series(&self, original_task_id: &TaskId) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted(|task| task.series_id() == original_task_id)
            .into_iter()
            .map(|e| e.task.clone())
            .collect())
    }

    async fn find_stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Task> = state
            .entries
            .values()
            .map(|e| &e.task)
            .filter(|task| {
                task.status == TaskStatus::Running
                    && task.started_at.is_some_and(|at| at < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|task| task.started_at);
        Ok(stale)
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for entry in state.entries.values() {
            counts.add(entry.task.status, 1);
        }
        Ok(counts)
    }
}
