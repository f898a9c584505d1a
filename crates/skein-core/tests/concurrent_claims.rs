//! Several stores (separate SQLite connections) racing for the same rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use skein_core::domain::NewTask;
use skein_core::impls::{SqliteOptions, SqliteTaskStore};
use skein_core::ports::SystemClock;
use skein_core::{TaskStatus, TaskStore, TaskTypeFilter};

const TASKS: usize = 200;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_row_is_claimed_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let options = || SqliteOptions {
        busy_timeout: Duration::from_secs(10),
        ..SqliteOptions::default()
    };

    let seed = SqliteTaskStore::open(&path, Arc::new(SystemClock), options()).unwrap();
    let due = Utc::now() - chrono::Duration::seconds(1);
    for n in 0..TASKS {
        seed.enqueue(NewTask::new(format!("task-{n:03}"), "echo", json!({ "n": n }), due))
            .await
            .unwrap();
    }

    let mut joins = Vec::new();
    for c in 0..CLAIMERS {
        let store = SqliteTaskStore::open(&path, Arc::new(SystemClock), options()).unwrap();
        joins.push(tokio::spawn(async move {
            let worker_id = format!("claimer-{c}");
            let mut claimed = Vec::new();
            while let Some(task) = store.claim_next(&worker_id, &TaskTypeFilter::Any).await.unwrap() {
                assert_eq!(task.worker_id.as_deref(), Some(worker_id.as_str()));
                assert!(store.mark_completed(&task.task_id).await.unwrap());
                claimed.push(task.task_id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for join in joins {
        for id in join.await.unwrap() {
            total += 1;
            assert!(seen.insert(id.clone()), "{id} was claimed twice");
        }
    }
    assert_eq!(total, TASKS);

    let counts = seed.counts_by_status().await.unwrap();
    assert_eq!(counts.get(TaskStatus::Completed), TASKS as u64);
    assert_eq!(counts.get(TaskStatus::Pending), 0);
    assert_eq!(counts.get(TaskStatus::Running), 0);
}
