//! Caller-facing queue handle.
//!
//! Chat handlers, HTTP routes and other task handlers enqueue through a [`TaskQueue`].
//! It fills in defaults (id, due time, retry budget), rejects rules that will never
//! parse, and pulses the wake signal so an idle worker picks the task up without waiting
//! for its poll interval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::WakeSignal;
use crate::domain::{DEFAULT_MAX_RETRIES, NewTask, StatusCounts, Task, TaskId, TaskType};
use crate::ports::{Clock, IdGenerator, RequeuePolicy, StoreError, TaskStore};
use crate::recurrence::{RecurrenceParseError, RecurrenceRule};
use crate::typed::TaskPayload;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid recurrence rule '{rule}': {source}")]
    InvalidRecurrence {
        rule: String,
        #[source]
        source: RecurrenceParseError,
    },

    #[error("payload encode error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Everything about an enqueue except what to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Generated when absent.
    pub task_id: Option<TaskId>,
    /// Now when absent.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub recurrence_rule: Option<String>,
    /// Attaches the row to an existing series. Defaults to the row itself when
    /// `recurrence_rule` is set.
    pub original_task_id: Option<TaskId>,
}

impl EnqueueOptions {
    pub fn id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
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
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub task_type: TaskType,
    pub payload: Value,
    pub options: EnqueueOptions,
}

impl EnqueueRequest {
    pub fn new(task_type: impl Into<TaskType>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            options: EnqueueOptions::default(),
        }
    }

    pub fn typed<T: TaskPayload>(task: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(T::TASK_TYPE, serde_json::to_value(task)?))
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    wake: WakeSignal,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    default_max_retries: u32,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        wake: WakeSignal,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            wake,
            clock,
            ids,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn wake_signal(&self) -> &WakeSignal {
        &self.wake
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, QueueError> {
        let EnqueueRequest {
            task_type,
            payload,
            options,
        } = request;

        if let Some(rule) = options.recurrence_rule.as_deref() {
            rule.parse::<RecurrenceRule>()
                .map_err(|source| QueueError::InvalidRecurrence {
                    rule: rule.to_string(),
                    source,
                })?;
        }

        let task_id = options
            .task_id
            .unwrap_or_else(|| self.ids.generate_task_id());
        let scheduled_at = options.scheduled_at.unwrap_or_else(|| self.clock.now());
        let mut new = NewTask::new(task_id.clone(), task_type, payload, scheduled_at)
            .max_retries(options.max_retries.unwrap_or(self.default_max_retries));
        new.recurrence_rule = options.recurrence_rule;
        new.original_task_id = options.original_task_id;

        debug!(
            task_id = %task_id,
            task_type = %new.task_type,
            scheduled_at = %new.scheduled_at,
            recurring = new.recurrence_rule.is_some(),
            "enqueue"
        );
        self.store.enqueue(new).await?;
        self.wake.pulse();
        Ok(task_id)
    }

    pub async fn enqueue_typed<T: TaskPayload>(
        &self,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<TaskId, QueueError> {
        self.enqueue(EnqueueRequest::typed(task)?.with_options(options))
            .await
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        Ok(self.store.list_tasks(limit).await?)
    }

    pub async fn list_series(&self, original_task_id: &TaskId) -> Result<Vec<Task>, QueueError> {
        Ok(self.store.list_series(original_task_id).await?)
    }

    /// `false` when the task is already terminal or does not exist.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        Ok(self.store.cancel(task_id).await?)
    }

    pub async fn cancel_series(&self, original_task_id: &TaskId) -> Result<u64, QueueError> {
        Ok(self.store.cancel_series(original_task_id).await?)
    }

    /// Puts a `failed` task back in line, due now.
    pub async fn requeue_failed(
        &self,
        task_id: &TaskId,
        policy: RequeuePolicy,
    ) -> Result<bool, QueueError> {
        let requeued = self
            .store
            .requeue_failed(task_id, policy, self.clock.now())
            .await?;
        if requeued {
            self.wake.pulse();
        }
        Ok(requeued)
    }

    pub async fn counts(&self) -> Result<StatusCounts, QueueError> {
        Ok(self.store.counts_by_status().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ManualClock, UlidGenerator};
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, TaskQueue) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let queue = TaskQueue::new(
            store,
            WakeSignal::new(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
        )
        .with_default_max_retries(5);
        (clock, queue)
    }

    #[tokio::test]
    async fn enqueue_fills_defaults_and_pulses_wake() {
        let (clock, queue) = setup();
        let mut wake = queue.wake_signal().subscribe();
        let id = queue
            .enqueue(EnqueueRequest::new("echo", json!({"msg": "hi"})))
            .await
            .unwrap();

        assert!(id.as_ulid().is_some());
        let row = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.scheduled_at, clock.now());
        assert_eq!(row.max_retries, 5);

        tokio::time::timeout(Duration::from_millis(50), wake.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bad_rule_is_rejected_before_insert() {
        let (_clock, queue) = setup();
        let err = queue
            .enqueue(
                EnqueueRequest::new("digest", json!({}))
                    .with_options(EnqueueOptions::default().id("d1").recurrence("FREQ=SOMETIMES")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::InvalidRecurrence { .. }));
        assert!(queue.get(&TaskId::new("d1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recurring_enqueue_starts_a_series() {
        let (_clock, queue) = setup();
        let id = queue
            .enqueue(
                EnqueueRequest::new("digest", json!({}))
                    .with_options(EnqueueOptions::default().id("d1").recurrence("FREQ=DAILY")),
            )
            .await
            .unwrap();

        let row = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(row.original_task_id, Some(TaskId::new("d1")));
        assert_eq!(row.recurrence_anchor, Some(row.scheduled_at));
        assert_eq!(queue.list_series(&id).await.unwrap().len(), 1);
    }

    #[derive(Serialize, Deserialize)]
    struct Remind {
        text: String,
    }

    impl TaskPayload for Remind {
        const TASK_TYPE: &'static str = "remind";
    }

    #[tokio::test]
    async fn typed_enqueue_uses_payload_type() {
        let (clock, queue) = setup();
        let later = clock.now() + chrono::Duration::minutes(10);
        let id = queue
            .enqueue_typed(
                &Remind { text: "stretch".into() },
                EnqueueOptions::default().at(later).max_retries(0),
            )
            .await
            .unwrap();

        let row = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(row.task_type.as_str(), "remind");
        assert_eq!(row.payload, json!({"text": "stretch"}));
        assert_eq!(row.scheduled_at, later);
        assert_eq!(row.max_retries, 0);
    }

    #[tokio::test]
    async fn cancel_and_counts() {
        let (_clock, queue) = setup();
        let a = queue.enqueue(EnqueueRequest::new("echo", json!(1))).await.unwrap();
        queue.enqueue(EnqueueRequest::new("echo", json!(2))).await.unwrap();

        assert!(queue.cancel(&a).await.unwrap());
        assert!(!queue.cancel(&a).await.unwrap());
        assert!(!queue.requeue_failed(&a, RequeuePolicy::ResetRetries).await.unwrap());

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.pending, counts.cancelled), (1, 1));
    }
}
