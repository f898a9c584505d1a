//! Behaviour both task stores must share.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;
use serde_json::json;
use skein_core::domain::NewTask;
use skein_core::impls::{InMemoryTaskStore, SqliteTaskStore};
use skein_core::ports::{ManualClock, RequeuePolicy, StoreError};
use skein_core::{Task, TaskId, TaskStatus, TaskStore, TaskTypeFilter};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

type Factory = fn(Arc<ManualClock>) -> Arc<dyn TaskStore>;

fn memory(clock: Arc<ManualClock>) -> Arc<dyn TaskStore> {
    Arc::new(InMemoryTaskStore::new(clock))
}

fn sqlite(clock: Arc<ManualClock>) -> Arc<dyn TaskStore> {
    Arc::new(SqliteTaskStore::open_in_memory(clock).unwrap())
}

async fn claim(store: &Arc<dyn TaskStore>) -> Task {
    store.claim_next("w1", &TaskTypeFilter::Any).await.unwrap().unwrap()
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn completion_is_idempotent(#[case] factory: Factory) {
    let store = factory(Arc::new(ManualClock::new(t0())));
    store.enqueue(NewTask::new("t1", "echo", json!({}), t0())).await.unwrap();
    let task = claim(&store).await;

    assert!(store.mark_completed(&task.task_id).await.unwrap());
    let first = store.get(&task.task_id).await.unwrap().unwrap();
    assert!(!store.mark_completed(&task.task_id).await.unwrap());
    assert_eq!(store.get(&task.task_id).await.unwrap().unwrap(), first);
    assert_eq!(first.status, TaskStatus::Completed);
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn claims_follow_due_time_then_insertion(#[case] factory: Factory) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = factory(clock.clone());
    store.enqueue(NewTask::new("later", "echo", json!({}), t0() + Duration::minutes(5))).await.unwrap();
    store.enqueue(NewTask::new("b", "echo", json!({}), t0())).await.unwrap();
    store.enqueue(NewTask::new("a", "echo", json!({}), t0())).await.unwrap();
    store
        .enqueue(NewTask::new("early", "echo", json!({}), t0() - Duration::minutes(1)))
        .await
        .unwrap();

    assert_eq!(claim(&store).await.task_id, TaskId::new("early"));
    assert_eq!(claim(&store).await.task_id, TaskId::new("b"));
    assert_eq!(claim(&store).await.task_id, TaskId::new("a"));
    assert!(store.claim_next("w1", &TaskTypeFilter::Any).await.unwrap().is_none());

    clock.advance(Duration::minutes(5));
    let later = claim(&store).await;
    assert_eq!(later.task_id, TaskId::new("later"));
    assert_eq!(later.status, TaskStatus::Running);
    assert_eq!(later.started_at, Some(t0() + Duration::minutes(5)));
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn duplicate_ids_are_refused(#[case] factory: Factory) {
    let store = factory(Arc::new(ManualClock::new(t0())));
    store.enqueue(NewTask::new("t1", "echo", json!({}), t0())).await.unwrap();
    let err = store
        .enqueue(NewTask::new("t1", "other", json!({}), t0()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateTask(id) if id == TaskId::new("t1")));
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn retry_budget_is_enforced_by_the_store(#[case] factory: Factory) {
    let store = factory(Arc::new(ManualClock::new(t0())));
    store
        .enqueue(NewTask::new("t1", "echo", json!({}), t0()).max_retries(1))
        .await
        .unwrap();
    let task = claim(&store).await;

    assert!(!store.reschedule_for_retry(&task.task_id, t0(), 2, "boom").await.unwrap());
    assert!(store.reschedule_for_retry(&task.task_id, t0(), 1, "boom").await.unwrap());
    let row = store.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("boom"));
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn terminal_rows_ignore_every_transition(#[case] factory: Factory) {
    let store = factory(Arc::new(ManualClock::new(t0())));
    store.enqueue(NewTask::new("t1", "echo", json!({}), t0())).await.unwrap();
    let id = TaskId::new("t1");
    assert!(store.cancel(&id).await.unwrap());

    assert!(!store.mark_completed(&id).await.unwrap());
    assert!(!store.mark_failed_permanently(&id, "late").await.unwrap());
    assert!(!store.reschedule_for_retry(&id, t0(), 1, "late").await.unwrap());
    assert!(!store.cancel(&id).await.unwrap());
    assert!(!store.requeue_failed(&id, RequeuePolicy::ResetRetries, t0()).await.unwrap());
    assert_eq!(store.get(&id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn successor_joins_the_series(#[case] factory: Factory) {
    let store = factory(Arc::new(ManualClock::new(t0())));
    store
        .enqueue(NewTask::new("d1", "echo", json!({"k": 1}), t0()).recurrence("FREQ=DAILY"))
        .await
        .unwrap();
    let task = claim(&store).await;

    let next_at = t0() + Duration::days(1);
    let successor = task.successor(TaskId::new("d2"), next_at);
    assert!(store.complete_with_successor(&task.task_id, successor.clone()).await.unwrap());
    assert!(!store.complete_with_successor(&task.task_id, successor).await.unwrap());

    let series = store.list_series(&TaskId::new("d1")).await.unwrap();
    let ids: Vec<_> = series.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, ["d1", "d2"]);
    assert_eq!(series[1].status, TaskStatus::Pending);
    assert_eq!(series[1].scheduled_at, next_at);
    assert_eq!(series[1].payload, json!({"k": 1}));
}

#[rstest]
#[case::memory(memory as Factory)]
#[case::sqlite(sqlite as Factory)]
#[tokio::test]
async fn failed_rows_are_listed_by_failure_time(#[case] factory: Factory) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = factory(clock.clone());
    for id in ["first", "second", "ok"] {
        store.enqueue(NewTask::new(id, "echo", json!({}), t0())).await.unwrap();
    }
    // Claimed in insertion order: "first" fails last, "second" fails before it.
    let first = claim(&store).await;
    let second = claim(&store).await;
    let ok = claim(&store).await;
    store.mark_completed(&ok.task_id).await.unwrap();
    clock.advance(Duration::seconds(1));
    store.mark_failed_permanently(&second.task_id, "boom").await.unwrap();
    clock.advance(Duration::seconds(1));
    store.mark_failed_permanently(&first.task_id, "boom").await.unwrap();

    let failed = store.list_failed(10).await.unwrap();
    let ids: Vec<_> = failed.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, ["first", "second"]);
    assert_eq!(store.list_failed(1).await.unwrap().len(), 1);
}
