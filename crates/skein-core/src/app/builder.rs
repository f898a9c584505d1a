//! EngineBuilder: wiring and start-up checks.
//!
//! ```ignore
//! let engine = EngineBuilder::new(services)
//!     .config(EngineConfig::load_from("skein.toml")?)
//!     .register_typed::<SendReminder, _>(SendReminderHandler)?
//!     .expect_tasks(&["reminders.send", "documents.embed"])
//!     .build()?;
//!
//! let queue = engine.queue();
//! let workers = engine.start();
//! // ...
//! workers.shutdown_and_join().await;
//! ```
//!
//! `build` fails fast: a config that does not validate, or a task type the application
//! expects to handle without a registered handler, stops start-up instead of turning
//! into failed rows later.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{ReaperLoop, ShutdownListener, ShutdownSignal, TaskQueue, TaskWorker, WakeSignal};
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{Decider, DefaultDecider, HandlerError, TaskType};
use crate::impls::SqliteTaskStore;
use crate::ports::{
    Clock, IdGenerator, StoreError, SystemClock, TaskStore, TaskTypeFilter, UlidGenerator,
};
use crate::typed::{
    Handler, HandlerContext, HandlerRegistry, RegistryError, TaskHandler, TaskPayload,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open task store: {0}")]
    Store(#[from] StoreError),
}

pub struct EngineBuilder<C = ()> {
    app: Arc<C>,
    registry: HandlerRegistry<C>,
    expected_tasks: Option<Vec<String>>,
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl<C: Send + Sync + 'static> EngineBuilder<C> {
    pub fn new(app: C) -> Self {
        Self::with_shared_app(Arc::new(app))
    }

    pub fn with_shared_app(app: Arc<C>) -> Self {
        Self {
            app,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            config: EngineConfig::default(),
            store: None,
            clock: Arc::new(SystemClock),
            decider: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `store` instead of opening the SQLite file named in the config.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retry/recurrence policy built from `config.retry`.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn register(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler<C>>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    pub fn register_typed<T, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        T: TaskPayload,
        H: Handler<T, C> + 'static,
    {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(
        mut self,
        task_type: impl Into<TaskType>,
        f: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(HandlerContext<C>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register_fn(task_type, f)?;
        Ok(self)
    }

    /// Task types that must have a handler by the time `build` runs.
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Engine<C>, BuildError> {
        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.registry.contains(&TaskType::new(t.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        self.config.validate()?;

        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteTaskStore::open(
                &self.config.store.path,
                Arc::clone(&self.clock),
                self.config.sqlite_options(),
            )?),
        };
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry_policy())));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));

        Ok(Engine {
            app: self.app,
            registry: Arc::new(self.registry),
            config: self.config,
            store,
            clock: self.clock,
            decider,
            ids,
            wake: WakeSignal::new(),
        })
    }
}

/// A wired engine. Cheap handles (queue, workers, reaper) are made from it on demand.
pub struct Engine<C = ()> {
    app: Arc<C>,
    registry: Arc<HandlerRegistry<C>>,
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    ids: Arc<dyn IdGenerator>,
    wake: WakeSignal,
}

impl<C: Send + Sync + 'static> Engine<C> {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry<C> {
        &self.registry
    }

    /// Enqueue handle sharing this engine's wake signal.
    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(
            Arc::clone(&self.store),
            self.wake.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
        )
        .with_default_max_retries(self.config.default_max_retries)
    }

    pub fn worker(&self, worker_id: impl Into<String>, filter: TaskTypeFilter) -> TaskWorker<C> {
        TaskWorker::new(
            worker_id,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.app),
        )
        .with_decider(Arc::clone(&self.decider))
        .with_clock(Arc::clone(&self.clock))
        .with_id_generator(Arc::clone(&self.ids))
        .with_wake(self.wake.clone())
        .with_filter(filter)
        .with_poll_interval(self.config.poll_interval())
        .with_max_error_len(self.config.max_error_len)
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.decider),
            Arc::clone(&self.clock),
            self.config.reaper_stale_after(),
            self.config.reaper_interval(),
        )
        .with_max_error_len(self.config.max_error_len)
    }

    /// Spawns every configured worker, plus the reaper when enabled.
    pub fn start(&self) -> WorkerGroup {
        let mut group = WorkerGroup::new();
        let pid = std::process::id();
        for pool in &self.config.pools {
            for index in 0..pool.concurrency {
                let worker = self.worker(format!("{}-{pid}-{index}", pool.name), pool.filter());
                group.spawn(move |shutdown| async move { worker.run(shutdown).await });
            }
        }
        if self.config.reaper.enabled {
            let reaper = self.reaper();
            group.spawn(move |shutdown| async move { reaper.run(shutdown).await });
        }
        info!(
            workers = group.len(),
            registered = ?self.registry.registered_types(),
            "engine started"
        );
        group
    }
}

/// Running workers that share one shutdown signal.
pub struct WorkerGroup {
    shutdown: ShutdownSignal,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self {
            shutdown: ShutdownSignal::new(),
            joins: Vec::new(),
        }
    }

    pub fn spawn<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(ShutdownListener) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = self.shutdown.listener();
        self.joins.push(tokio::spawn(f(listener)));
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Asks every loop to stop after its current task. Does not wait.
    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
        info!("all workers stopped");
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}
