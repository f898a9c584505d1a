//! SQLite task store.
//!
//! One `tasks` table, timestamps as unix milliseconds, payload as JSON text. rusqlite
//! is synchronous, so every call runs on the blocking pool behind a mutex-guarded
//! connection. Several processes may open the same file: the claim takes SQLite's
//! write lock up front (`BEGIN IMMEDIATE`), so the select and the update that follow
//! cannot interleave with another claimer.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params, params_from_iter,
};
use tracing::{debug, info};

use super::TransientRetry;
use crate::domain::{NewTask, StatusCounts, Task, TaskId, TaskStatus, TaskType};
use crate::ports::{Clock, RequeuePolicy, StoreError, TaskStore, TaskTypeFilter};

/// Schema versions, applied in order and recorded in `schema_migrations`.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE tasks (
        task_id           TEXT PRIMARY KEY,
        task_type         TEXT NOT NULL,
        payload           TEXT NOT NULL,
        status            TEXT NOT NULL
                          CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
        scheduled_at      INTEGER NOT NULL,
        created_at        INTEGER NOT NULL,
        started_at        INTEGER,
        completed_at      INTEGER,
        worker_id         TEXT,
        retry_count       INTEGER NOT NULL DEFAULT 0,
        max_retries       INTEGER NOT NULL,
        last_error        TEXT,
        recurrence_rule   TEXT,
        original_task_id  TEXT,
        recurrence_anchor INTEGER
    );
    CREATE INDEX idx_tasks_due ON tasks (status, scheduled_at);
    CREATE INDEX idx_tasks_series ON tasks (original_task_id);
    CREATE INDEX idx_tasks_created ON tasks (created_at);",
)];

const COLUMNS: &str = "task_id, task_type, payload, status, scheduled_at, created_at, \
    started_at, completed_at, worker_id, retry_count, max_retries, last_error, \
    recurrence_rule, original_task_id, recurrence_anchor";

const INSERT_TASK: &str = "INSERT INTO tasks (task_id, task_type, payload, status, \
    scheduled_at, created_at, started_at, completed_at, worker_id, retry_count, max_retries, \
    last_error, recurrence_rule, original_task_id, recurrence_anchor) \
    VALUES (?1, ?2, ?3, 'pending', ?4, ?5, NULL, NULL, NULL, 0, ?6, NULL, ?7, ?8, ?9)";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Busy(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// How long SQLite itself waits on a locked database before reporting busy.
    pub busy_timeout: Duration,
    /// What happens after it does.
    pub transient: TransientRetry,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            transient: TransientRetry::default(),
        }
    }
}

/// `TaskStore` over one SQLite connection.
///
/// # Thread Safety
/// The connection sits behind a `std::sync::Mutex` and is only touched from
/// `spawn_blocking`, so async callers never block the runtime. Several stores (in this
/// process or others) may open the same file; `claim_next` takes the write lock up
/// front with an IMMEDIATE transaction, which is what keeps two of them from claiming
/// the same row.
///
/// # Errors
/// `SQLITE_BUSY` and `SQLITE_LOCKED` surface as [`StoreError::Busy`] and are retried
/// by [`TransientRetry`] before reaching the caller.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    retry: TransientRetry,
}

impl SqliteTaskStore {
    /// Opens (creating if needed) the database file and brings its schema up to date.
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        options: SqliteOptions,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        info!(path = %path.display(), "opened sqlite task store");
        Self::init(conn, clock, options)
    }

    /// Private database, gone when the store is dropped.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, clock, SqliteOptions::default())
    }

    fn init(
        mut conn: Connection,
        clock: Arc<dyn Clock>,
        options: SqliteOptions,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(options.busy_timeout)?;
        migrate(&mut conn, clock.now())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            retry: options.transient,
        })
    }

    /// Runs `f` on the blocking pool, retrying transient failures.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.retry
            .run(op, || {
                let conn = Arc::clone(&self.conn);
                let f = Arc::clone(&f);
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut guard = conn.lock().map_err(|_| {
                            StoreError::Backend("sqlite connection mutex poisoned".to_string())
                        })?;
                        f(&mut guard)
                    })
                    .await
                    .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
                }
            })
            .await
    }
}

fn migrate(conn: &mut Connection, now: DateTime<Utc>) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;
    let current: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, dt_to_ms(now)],
        )?;
        debug!(version, "applied task store migration");
    }
    tx.commit()?;
    Ok(())
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(task_id: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        task_id: task_id.to_string(),
        reason: format!("timestamp {ms} out of range"),
    })
}

fn opt_ms_to_dt(task_id: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| ms_to_dt(task_id, ms)).transpose()
}

fn count_from_sql(task_id: &str, field: &str, n: i64) -> Result<u32, StoreError> {
    u32::try_from(n).map_err(|_| StoreError::Corrupt {
        task_id: task_id.to_string(),
        reason: format!("{field} = {n}"),
    })
}

/// A row as stored, before validation.
struct RawTask {
    task_id: String,
    task_type: String,
    payload: String,
    status: String,
    scheduled_at: i64,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    worker_id: Option<String>,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    recurrence_rule: Option<String>,
    original_task_id: Option<String>,
    recurrence_anchor: Option<i64>,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            task_type: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            scheduled_at: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            worker_id: row.get(8)?,
            retry_count: row.get(9)?,
            max_retries: row.get(10)?,
            last_error: row.get(11)?,
            recurrence_rule: row.get(12)?,
            original_task_id: row.get(13)?,
            recurrence_anchor: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let id = self.task_id.as_str();
        let status = self.status.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
            task_id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Task {
            payload: serde_json::from_str(&self.payload)?,
            status,
            scheduled_at: ms_to_dt(id, self.scheduled_at)?,
            created_at: ms_to_dt(id, self.created_at)?,
            started_at: opt_ms_to_dt(id, self.started_at)?,
            completed_at: opt_ms_to_dt(id, self.completed_at)?,
            retry_count: count_from_sql(id, "retry_count", self.retry_count)?,
            max_retries: count_from_sql(id, "max_retries", self.max_retries)?,
            recurrence_anchor: opt_ms_to_dt(id, self.recurrence_anchor)?,
            task_type: TaskType::new(self.task_type),
            worker_id: self.worker_id,
            last_error: self.last_error,
            recurrence_rule: self.recurrence_rule,
            original_task_id: self.original_task_id.map(TaskId::new),
            task_id: TaskId::new(self.task_id),
        })
    }
}

fn insert_task(conn: &Connection, task: NewTask, created_at: DateTime<Utc>) -> Result<(), StoreError> {
    let task = task.normalized();
    let payload = serde_json::to_string(&task.payload)?;
    let result = conn.execute(
        INSERT_TASK,
        params![
            task.task_id.as_str(),
            task.task_type.as_str(),
            payload,
            dt_to_ms(task.scheduled_at),
            dt_to_ms(created_at),
            task.max_retries,
            task.recurrence_rule,
            task.original_task_id.as_ref().map(TaskId::as_str),
            task.recurrence_anchor.map(dt_to_ms),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                ) =>
        {
            Err(StoreError::DuplicateTask(task.task_id))
        }
        Err(e) => Err(e.into()),
    }
}

fn select_task(conn: &Connection, task_id: &str) -> Result<Option<Task>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tasks WHERE task_id = ?1"),
        [task_id],
        RawTask::from_row,
    )
    .optional()?
    .map(RawTask::into_task)
    .transpose()
}

fn select_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, RawTask::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawTask::into_task).collect()
}

fn claim(
    conn: &mut Connection,
    worker_id: &str,
    accepted: &TaskTypeFilter,
    now: i64,
) -> Result<Option<Task>, StoreError> {
    let mut sql = String::from(
        "SELECT task_id FROM tasks WHERE status = 'pending' AND scheduled_at <= ?1",
    );
    let mut values = vec![Value::Integer(now)];
    if let TaskTypeFilter::Only(types) = accepted {
        if types.is_empty() {
            return Ok(None);
        }
        let placeholders: Vec<String> = (0..types.len()).map(|i| format!("?{}", i + 2)).collect();
        sql.push_str(&format!(" AND task_type IN ({})", placeholders.join(", ")));
        values.extend(types.iter().map(|t| Value::Text(t.as_str().to_string())));
    }
    sql.push_str(" ORDER BY scheduled_at ASC, created_at ASC, rowid ASC LIMIT 1");

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let candidate: Option<String> = tx
        .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
        .optional()?;
    let Some(task_id) = candidate else {
        return Ok(None);
    };
    let updated = tx.execute(
        "UPDATE tasks SET status = 'running', worker_id = ?1, started_at = ?2
         WHERE task_id = ?3 AND status = 'pending'",
        params![worker_id, now, task_id],
    )?;
    if updated != 1 {
        return Ok(None);
    }
    let task = select_task(&tx, &task_id)?;
    tx.commit()?;
    Ok(task)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<(), StoreError> {
        let created_at = self.clock.now();
        self.run("enqueue", move |conn| insert_task(conn, task.clone(), created_at))
            .await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        accepted: &TaskTypeFilter,
    ) -> Result<Option<Task>, StoreError> {
        let now = dt_to_ms(self.clock.now());
        let worker_id = worker_id.to_string();
        let accepted = accepted.clone();
        self.run("claim_next", move |conn| claim(conn, &worker_id, &accepted, now))
            .await
    }

    async fn mark_completed(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let now = dt_to_ms(self.clock.now());
        let task_id = task_id.clone();
        self.run("mark_completed", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1
                 WHERE task_id = ?2 AND status = 'running'",
                params![now, task_id.as_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn complete_with_successor(
        &self,
        task_id: &TaskId,
        successor: NewTask,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let task_id = task_id.clone();
        self.run("complete_with_successor", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1
                 WHERE task_id = ?2 AND status = 'running'",
                params![dt_to_ms(now), task_id.as_str()],
            )?;
            if changed != 1 {
                return Ok(false);
            }
            insert_task(&tx, successor.clone(), now)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn mark_failed_permanently(
        &self,
        task_id: &TaskId,
        error: &str,
    ) -> Result<bool, StoreError> {
        let now = dt_to_ms(self.clock.now());
        let task_id = task_id.clone();
        let error = error.to_string();
        self.run("mark_failed_permanently", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?1, last_error = ?2
                 WHERE task_id = ?3 AND status = 'running'",
                params![now, error, task_id.as_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reschedule_for_retry(
        &self,
        task_id: &TaskId,
        next_scheduled_at: DateTime<Utc>,
        new_retry_count: u32,
        error: &str,
    ) -> Result<bool, StoreError> {
        let next = dt_to_ms(next_scheduled_at);
        let task_id = task_id.clone();
        let error = error.to_string();
        self.run("reschedule_for_retry", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', scheduled_at = ?1, retry_count = ?2,
                                  last_error = ?3
                 WHERE task_id = ?4 AND status = 'running' AND ?2 <= max_retries",
                params![next, new_retry_count, error, task_id.as_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let now = dt_to_ms(self.clock.now());
        let task_id = task_id.clone();
        self.run("cancel", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                 WHERE task_id = ?2 AND status IN ('pending', 'running')",
                params![now, task_id.as_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn cancel_series(&self, original_task_id: &TaskId) -> Result<u64, StoreError> {
        let now = dt_to_ms(self.clock.now());
        let series = original_task_id.clone();
        self.run("cancel_series", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                 WHERE (original_task_id = ?2 OR task_id = ?2)
                   AND status IN ('pending', 'running')",
                params![now, series.as_str()],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn requeue_failed(
        &self,
        task_id: &TaskId,
        policy: RequeuePolicy,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let at = dt_to_ms(scheduled_at);
        let reset = policy == RequeuePolicy::ResetRetries;
        let task_id = task_id.clone();
        self.run("requeue_failed", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', scheduled_at = ?1, started_at = NULL,
                                  completed_at = NULL,
                                  retry_count = CASE WHEN ?2 THEN 0 ELSE retry_count END
                 WHERE task_id = ?3 AND status = 'failed'",
                params![at, reset, task_id.as_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.clone();
        self.run("get", move |conn| select_task(conn, task_id.as_str()))
            .await
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run("list_tasks", move |conn| {
            select_tasks(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ),
                [limit],
            )
        })
        .await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run("list_failed", move |conn| {
            select_tasks(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM tasks WHERE status = 'failed'
                     ORDER BY completed_at DESC, rowid DESC LIMIT ?1"
                ),
                [limit],
            )
        })
        .await
    }

    async fn list_series(&self, original_task_id: &TaskId) -> Result<Vec<Task>, StoreError> {
        let series = original_task_id.clone();
        self.run("list_series", move |conn| {
            select_tasks(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM tasks WHERE original_task_id = ?1 OR task_id = ?1
                     ORDER BY created_at ASC, rowid ASC"
                ),
                [series.as_str()],
            )
        })
        .await
    }

    async fn find_stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let before = dt_to_ms(started_before);
        self.run("find_stale_running", move |conn| {
            select_tasks(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM tasks WHERE status = 'running' AND started_at < ?1
                     ORDER BY started_at ASC"
                ),
                [before],
            )
        })
        .await
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.run("counts_by_status", |conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut counts = StatusCounts::default();
            for (status, n) in rows {
                let status = status.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
                    task_id: "*".to_string(),
                    reason: e.to_string(),
                })?;
                counts.add(status, n.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }
}
