//! End-to-end task lifecycles driven through the engine with a manual clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};
use skein_core::app::{EnqueueOptions, EnqueueRequest, RunOutcome};
use skein_core::config::RetryConfig;
use skein_core::domain::HandlerError;
use skein_core::impls::SqliteTaskStore;
use skein_core::ports::{Clock, ManualClock};
use skein_core::{Engine, EngineBuilder, EngineConfig, TaskId, TaskStatus, TaskTypeFilter};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

struct Harness {
    clock: Arc<ManualClock>,
    engine: Engine,
    calls: Arc<AtomicU32>,
}

/// `echo` fails its first `fail_first` calls, then succeeds.
fn harness(fail_first: u32) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(SqliteTaskStore::open_in_memory(clock.clone()).unwrap());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let config = EngineConfig {
        retry: RetryConfig {
            base_delay_ms: 10_000,
            ..RetryConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = EngineBuilder::new(())
        .config(config)
        .store(store)
        .clock(clock.clone())
        .register_fn("echo", move |_ctx, _payload: Value| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < fail_first {
                    Err(HandlerError::new("temporarily unavailable"))
                } else {
                    Ok(())
                }
            }
        })
        .unwrap()
        .build()
        .unwrap();
    Harness {
        clock,
        engine,
        calls,
    }
}

async fn enqueue(h: &Harness, options: EnqueueOptions) -> TaskId {
    h.engine
        .queue()
        .enqueue(EnqueueRequest::new("echo", json!({"msg": "hi"})).with_options(options))
        .await
        .unwrap()
}

#[tokio::test]
async fn flaky_task_completes_on_its_last_allowed_attempt() {
    let h = harness(2);
    let id = enqueue(&h, EnqueueOptions::default().id("t1").max_retries(2)).await;
    let worker = h.engine.worker("w1", TaskTypeFilter::Any);

    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(RunOutcome::RetryScheduled {
            retry_count: 1,
            at: t0() + Duration::seconds(10),
        })
    );
    h.clock.advance(Duration::seconds(10));
    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(RunOutcome::RetryScheduled {
            retry_count: 2,
            at: t0() + Duration::seconds(30),
        })
    );
    h.clock.advance(Duration::seconds(20));
    assert_eq!(worker.run_once().await.unwrap(), Some(RunOutcome::Completed));

    let row = h.engine.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert_eq!(row.retry_count, 2);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn always_failing_task_runs_max_retries_plus_one_times() {
    let h = harness(u32::MAX);
    let id = enqueue(&h, EnqueueOptions::default().max_retries(3)).await;
    let worker = h.engine.worker("w1", TaskTypeFilter::Any);

    loop {
        match worker.run_once().await.unwrap() {
            Some(RunOutcome::RetryScheduled { at, .. }) => h.clock.set(at),
            Some(RunOutcome::Failed { .. }) => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    let row = h.engine.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert_eq!(h.calls.load(Ordering::SeqCst), 4);
    assert!(row.last_error.unwrap().contains("temporarily unavailable"));
    assert_eq!(worker.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn retries_back_off_further_each_time() {
    let h = harness(u32::MAX);
    enqueue(&h, EnqueueOptions::default().max_retries(5)).await;
    let worker = h.engine.worker("w1", TaskTypeFilter::Any);

    let mut gaps = Vec::new();
    while let Some(RunOutcome::RetryScheduled { at, .. }) = worker.run_once().await.unwrap() {
        gaps.push(at - h.clock.now());
        h.clock.set(at);
    }
    assert_eq!(gaps.len(), 5);
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "gaps {gaps:?}");
}

#[tokio::test]
async fn counted_hourly_series_produces_exactly_count_rows() {
    let h = harness(0);
    let first = enqueue(
        &h,
        EnqueueOptions::default().id("hourly").recurrence("FREQ=HOURLY;COUNT=3"),
    )
    .await;
    let worker = h.engine.worker("w1", TaskTypeFilter::Any);

    for hour in 1..=2 {
        let outcome = worker.run_once().await.unwrap();
        assert!(
            matches!(&outcome, Some(RunOutcome::Recurred { next_at, .. }) if *next_at == t0() + Duration::hours(hour)),
            "hour {hour}: {outcome:?}"
        );
        h.clock.advance(Duration::hours(1));
    }
    assert_eq!(worker.run_once().await.unwrap(), Some(RunOutcome::Completed));
    assert_eq!(worker.run_once().await.unwrap(), None);

    let series = h.engine.queue().list_series(&first).await.unwrap();
    assert_eq!(series.len(), 3);
    assert!(series.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(series[1..].iter().all(|t| t.original_task_id.as_ref() == Some(&first)));
    let times: Vec<_> = series.iter().map(|t| t.scheduled_at).collect();
    assert_eq!(
        times,
        vec![t0(), t0() + Duration::hours(1), t0() + Duration::hours(2)]
    );
}

#[tokio::test]
async fn single_occurrence_daily_rule_leaves_no_successor() {
    let h = harness(0);
    let first = enqueue(&h, EnqueueOptions::default().recurrence("FREQ=DAILY;COUNT=1")).await;

    let outcome = h.engine.worker("w1", TaskTypeFilter::Any).run_once().await.unwrap();
    assert_eq!(outcome, Some(RunOutcome::Completed));
    assert_eq!(h.engine.queue().list_series(&first).await.unwrap().len(), 1);
    assert_eq!(h.engine.queue().counts().await.unwrap().pending, 0);
}

#[tokio::test]
async fn open_ended_daily_rule_keeps_one_pending_successor() {
    let h = harness(0);
    let first = enqueue(&h, EnqueueOptions::default().recurrence("FREQ=DAILY")).await;

    let outcome = h.engine.worker("w1", TaskTypeFilter::Any).run_once().await.unwrap();
    let Some(RunOutcome::Recurred { next_task_id, next_at }) = outcome else {
        panic!("expected recurrence, got {outcome:?}");
    };
    assert_eq!(next_at, t0() + Duration::days(1));

    let queue = h.engine.queue();
    let next = queue.get(&next_task_id).await.unwrap().unwrap();
    assert_eq!(next.status, TaskStatus::Pending);
    assert_eq!(next.original_task_id, Some(first.clone()));
    assert_eq!(next.recurrence_rule.as_deref(), Some("FREQ=DAILY"));
    assert_eq!(next.retry_count, 0);
    assert_eq!(queue.counts().await.unwrap().pending, 1);

    assert_eq!(queue.cancel_series(&first).await.unwrap(), 1);
    assert_eq!(queue.get(&next_task_id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn enqueue_rejects_a_malformed_rule_up_front() {
    let h = harness(0);
    let err = h
        .engine
        .queue()
        .enqueue(
            EnqueueRequest::new("echo", json!({}))
                .with_options(EnqueueOptions::default().recurrence("FREQ=SOMETIMES")),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("FREQ=SOMETIMES"), "{err}");
    assert_eq!(h.engine.queue().counts().await.unwrap().total(), 0);
}
