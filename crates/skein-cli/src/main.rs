//! skein - operator CLI for a skein task database.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use skein_core::app::{EnqueueOptions, EnqueueRequest, StatusReport};
use skein_core::config::PoolConfig;
use skein_core::ports::RequeuePolicy;
use skein_core::{Engine, EngineBuilder, EngineConfig, Task, TaskId};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod handlers;

use handlers::{FailHandler, FailTask};

/// skein - a durable task queue on SQLite
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file; overrides `store.path` from the config
    #[arg(long, env = "SKEIN_DB", global = true)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers with the built-in `echo` and `fail` handlers until Ctrl-C
    Run {
        /// Number of workers; replaces the configured pools with a single one
        #[arg(long)]
        workers: Option<usize>,

        /// Only claim these task types (comma separated)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
    },

    /// Enqueue a task
    Enqueue {
        task_type: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,

        #[arg(long)]
        id: Option<String>,

        /// Run this many seconds from now instead of immediately
        #[arg(long)]
        delay_secs: Option<i64>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// RFC 5545 recurrence rule, e.g. "FREQ=DAILY;BYHOUR=8"
        #[arg(long)]
        rrule: Option<String>,
    },

    /// List the most recently created tasks
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one task as JSON, with its series if it recurs
    Show { id: String },

    /// Cancel a pending or running task
    Cancel {
        id: String,

        /// Cancel every unfinished occurrence of the series this id starts
        #[arg(long)]
        series: bool,
    },

    /// Put a failed task back in the queue
    Retry {
        id: String,

        /// Give the task its full retry budget again
        #[arg(long)]
        reset: bool,
    },

    /// Recover claims abandoned by crashed workers, once
    Sweep {
        /// Treat rows running longer than this as abandoned
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },

    /// Task counts and recent failures
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    match cli.command {
        Commands::Run { workers, types } => {
            if workers.is_some() || !types.is_empty() {
                config.pools = vec![PoolConfig {
                    name: "cli".to_string(),
                    concurrency: workers.unwrap_or(1),
                    task_types: (!types.is_empty()).then_some(types),
                }];
            }
            let engine = build_engine(config)?;
            let group = engine.start();
            info!(db = %engine.config().store.path.display(), "running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutdown requested, finishing in-flight tasks");
            group.shutdown_and_join().await;
        }

        Commands::Enqueue {
            task_type,
            payload,
            id,
            delay_secs,
            max_retries,
            rrule,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut options = EnqueueOptions::default();
            options.task_id = id.map(TaskId::new);
            options.max_retries = max_retries;
            options.recurrence_rule = rrule;
            if let Some(secs) = delay_secs {
                options.scheduled_at = Some(Utc::now() + chrono::Duration::seconds(secs));
            }

            let engine = build_engine(config)?;
            let task_id = engine
                .queue()
                .enqueue(EnqueueRequest::new(task_type.as_str(), payload).with_options(options))
                .await?;
            println!("{task_id}");
        }

        Commands::List { limit } => {
            let engine = build_engine(config)?;
            for task in engine.queue().list(limit).await? {
                print_row(&task);
            }
        }

        Commands::Show { id } => {
            let engine = build_engine(config)?;
            let queue = engine.queue();
            let task_id = TaskId::new(id);
            let Some(task) = queue.get(&task_id).await? else {
                bail!("task {task_id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
            if task.is_recurring() {
                println!("series {}:", task.series_id());
                for occurrence in queue.list_series(task.series_id()).await? {
                    print_row(&occurrence);
                }
            }
        }

        Commands::Cancel { id, series } => {
            let engine = build_engine(config)?;
            let queue = engine.queue();
            let task_id = TaskId::new(id);
            if series {
                let n = queue.cancel_series(&task_id).await?;
                println!("cancelled {n} task(s) in series {task_id}");
            } else if queue.cancel(&task_id).await? {
                println!("cancelled {task_id}");
            } else {
                bail!("task {task_id} is not pending or running");
            }
        }

        Commands::Retry { id, reset } => {
            let policy = if reset {
                RequeuePolicy::ResetRetries
            } else {
                RequeuePolicy::PreserveRetries
            };
            let engine = build_engine(config)?;
            let task_id = TaskId::new(id);
            if !engine.queue().requeue_failed(&task_id, policy).await? {
                bail!("task {task_id} is not failed");
            }
            println!("requeued {task_id}");
        }

        Commands::Sweep { stale_after_secs } => {
            if let Some(secs) = stale_after_secs {
                config.reaper.stale_after_secs = secs;
            }
            let engine = build_engine(config)?;
            let report = engine.reaper().sweep().await?;
            println!("requeued {}, failed {}", report.requeued, report.failed);
        }

        Commands::Status { json } => {
            let engine = build_engine(config)?;
            let report = StatusReport::collect(engine.store().as_ref(), Utc::now(), 10).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
    }

    Ok(())
}

fn build_engine(config: EngineConfig) -> Result<Engine> {
    let engine = EngineBuilder::new(())
        .config(config)
        .register_fn("echo", handlers::echo)?
        .register_typed::<FailTask, _>(FailHandler)?
        .build()
        .context("starting engine")?;
    Ok(engine)
}

fn print_row(task: &Task) {
    println!(
        "{:<32} {:<12} {:<10} {}/{} {} {}",
        task.task_id,
        task.task_type,
        task.status,
        task.retry_count,
        task.max_retries,
        task.scheduled_at.to_rfc3339(),
        task.last_error.as_deref().unwrap_or("")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use skein_core::config::StoreConfig;
    use skein_core::{TaskStatus, TaskTypeFilter};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_enqueue_with_options() {
        let cli = Cli::try_parse_from([
            "skein",
            "--db",
            "/tmp/x.db",
            "enqueue",
            "echo",
            r#"{"msg":"hi"}"#,
            "--max-retries",
            "2",
            "--rrule",
            "FREQ=HOURLY;COUNT=3",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::Enqueue {
                task_type,
                max_retries,
                rrule,
                ..
            } => {
                assert_eq!(task_type, "echo");
                assert_eq!(max_retries, Some(2));
                assert_eq!(rrule.as_deref(), Some("FREQ=HOURLY;COUNT=3"));
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn run_types_split_on_commas() {
        let cli = Cli::try_parse_from(["skein", "run", "--types", "echo,fail"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { types, .. } if types == ["echo", "fail"]));
    }

    #[tokio::test]
    async fn engine_runs_demo_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            store: StoreConfig {
                path: dir.path().join("cli.db"),
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let engine = build_engine(config).unwrap();
        let queue = engine.queue();
        let options = EnqueueOptions::default().max_retries(0);
        let ok = queue
            .enqueue(
                EnqueueRequest::new("echo", serde_json::json!({"msg": "hi"}))
                    .with_options(options.clone()),
            )
            .await
            .unwrap();
        let fail = FailTask {
            permanent: true,
            ..Default::default()
        };
        let bad = queue.enqueue_typed(&fail, options).await.unwrap();

        let worker = engine.worker("test", TaskTypeFilter::Any);
        while worker.run_once().await.unwrap().is_some() {}

        let status = |task: Option<Task>| task.unwrap().status;
        assert_eq!(status(queue.get(&ok).await.unwrap()), TaskStatus::Completed);
        assert_eq!(status(queue.get(&bad).await.unwrap()), TaskStatus::Failed);
    }
}
