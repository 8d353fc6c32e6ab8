//! `fireline` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — run the engine behind the HTTP API, with the TTL sweeper.
//! - `run`      — submit a workflow file and execute it with a local worker.
//! - `validate` — check a workflow file without submitting it.
//! - `replay`   — rebuild the launch histories of a recorded firework.
//! - `migrate`  — run pending database migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use engine::{
    validate_dag, Engine, EngineConfig, FWorker, Firework, FwState, Launch, PipelineConfig, RerunPolicy,
    Rocket, RocketConfig, Sweeper, SweeperConfig, WorkflowSpec,
};
use serde_json::{json, Value};
use store::PgStore;
use tasks::TaskRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fireline", about = "DAG workflow engine with pull-based workers", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// Postgres URL. Without it the engine keeps state in memory only.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, env = "FIRELINE_DB_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

#[derive(Args)]
struct EngineArgs {
    /// Seconds a reservation may wait for its worker to start.
    #[arg(long, env = "FIRELINE_RESERVATION_TTL", default_value_t = 14 * 24 * 3600)]
    reservation_ttl: u64,
    /// Seconds a RUNNING launch may go without a heartbeat.
    #[arg(long, env = "FIRELINE_LOSTRUN_TTL", default_value_t = 4 * 3600)]
    lostrun_ttl: u64,
    /// Automatic reruns granted to a fizzled firework.
    #[arg(long, env = "FIRELINE_MAX_AUTO_RERUNS", default_value_t = 0)]
    max_auto_reruns: u32,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        EngineConfig {
            reservation_ttl: Duration::from_secs(self.reservation_ttl),
            lostrun_ttl: Duration::from_secs(self.lostrun_ttl),
            rerun: RerunPolicy {
                max_auto_reruns: self.max_auto_reruns,
            },
            ..EngineConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the worker and operator API.
    Serve {
        #[arg(long, env = "FIRELINE_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
        /// Seconds between TTL sweeps.
        #[arg(long, env = "FIRELINE_SWEEP_INTERVAL", default_value_t = 60)]
        sweep_interval: u64,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Submit a workflow file and run it to exhaustion with a local worker.
    Run {
        /// Workflow (or single firework) JSON file.
        path: PathBuf,
        /// Directory that receives one `launcher_<id>` dir per launch.
        #[arg(long, env = "FIRELINE_LAUNCH_ROOT", default_value = ".")]
        launch_root: PathBuf,
        /// Stop after this many launches.
        #[arg(long)]
        max_launches: Option<usize>,
        /// In-place retries for tasks that fail with a retryable error.
        #[arg(long, env = "FIRELINE_TASK_RETRIES", default_value_t = 0)]
        task_retries: u32,
        #[arg(long, env = "FIRELINE_WORKER_NAME")]
        worker_name: Option<String>,
        #[arg(long, env = "FIRELINE_WORKER_CATEGORY", default_value = "")]
        category: String,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Validate a workflow file.
    Validate {
        path: PathBuf,
    },
    /// Replay the launch histories of a recorded firework document.
    Replay {
        path: PathBuf,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve {
            bind,
            sweep_interval,
            store,
            engine,
        } => {
            let engine = open_engine(&store, engine.config()).await?;
            let sweeper = Sweeper::new(
                Arc::clone(&engine),
                SweeperConfig {
                    interval: Duration::from_secs(sweep_interval),
                },
            )
            .spawn();

            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "cannot listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                info!("shutting down");
            };
            let served = api::serve(&bind, api::AppState { engine }, shutdown).await;
            sweeper.abort();
            served.with_context(|| format!("API server on {bind} failed"))?;
        }
        Command::Run {
            path,
            launch_root,
            max_launches,
            task_retries,
            worker_name,
            category,
            store,
            engine,
        } => {
            let spec = read_workflow(&path)?;
            let engine = open_engine(&store, engine.config()).await?;
            let submitted = engine.submit(spec).await?;
            info!(wf_id = submitted.wf_id, fireworks = submitted.id_map.len(), "workflow submitted");

            let mut worker = FWorker::default().with_category(category);
            if let Some(name) = worker_name {
                worker.name = name;
            }
            let config = RocketConfig {
                launch_root,
                pipeline: PipelineConfig {
                    task_retries,
                    ..PipelineConfig::default()
                },
                ..RocketConfig::default()
            };
            let rocket = Rocket::new(
                Arc::clone(&engine),
                Arc::new(TaskRegistry::with_builtins()),
                worker,
                config,
            );
            let reports = rocket.rapidfire(max_launches).await?;

            let wf = engine
                .workflow(submitted.wf_id)
                .await
                .context("submitted workflow disappeared")?;
            let summary = json!({
                "wf_id": wf.wf_id,
                "state": wf.state,
                "launches": reports.len(),
                "fireworks": wf.fw_states,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if wf.state != FwState::Completed {
                bail!("workflow {} ended {}", wf.wf_id, wf.state);
            }
        }
        Command::Validate { path } => {
            let spec = read_workflow(&path)?;
            let order = validate_dag(&spec).with_context(|| format!("{} is not a valid workflow", path.display()))?;
            println!("{} is valid; topological order: {order:?}", path.display());
        }
        Command::Replay { path } => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
            let fw: Firework = serde_json::from_str(&raw).context("not a firework document")?;
            println!("{}", serde_json::to_string_pretty(&replay(&fw))?);
        }
        Command::Migrate { database_url } => {
            let store = PgStore::connect(&database_url, 2).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }
    Ok(())
}

async fn open_engine(args: &StoreArgs, config: EngineConfig) -> anyhow::Result<Arc<Engine>> {
    let Some(url) = &args.database_url else {
        warn!("no DATABASE_URL; state is kept in memory and lost on exit");
        return Ok(Arc::new(Engine::in_memory(config)));
    };
    let store = PgStore::connect(url, args.max_connections)
        .await
        .context("cannot connect to the database")?;
    store.migrate().await?;
    Ok(Arc::new(Engine::open(Arc::new(store), config).await?))
}

fn read_workflow(path: &Path) -> anyhow::Result<WorkflowSpec> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", path.display()))?;
    Ok(WorkflowSpec::from_value(&value)?)
}

fn replay(fw: &Firework) -> Value {
    let launches: Vec<Value> = fw
        .launches
        .iter()
        .map(|recorded| {
            match Launch::replay(
                recorded.launch_id,
                recorded.fw_id,
                recorded.fworker.clone(),
                &recorded.state_history,
            ) {
                Some(launch) => json!({
                    "launch_id": launch.launch_id,
                    "state": launch.state,
                    "recorded_state": recorded.state,
                    "reservation_id": launch.reservation_id(),
                    "state_history": launch.state_history,
                }),
                None => json!({ "launch_id": recorded.launch_id, "state_history": [] }),
            }
        })
        .collect();

    json!({
        "fw_id": fw.fw_id,
        "name": fw.name,
        "state": fw.state,
        "failed_runs": fw.failed_runs(),
        "active_launch": fw.active_launch().map(|l| l.launch_id),
        "launches": launches,
    })
}
