//! `Rocket` — the worker-side loop: claim a firework, start it, run its
//! tasks, report the result.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tasks::{FwAction, TaskContext, TaskRegistry};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::RocketConfig;
use crate::lifecycle::RuntimeInfo;
use crate::models::{FWorker, FwId, FwState, LaunchId, Tracker};
use crate::pipeline::{CancellationProbe, TaskPipeline};
use crate::{Engine, EngineError};

/// What one launch did.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchReport {
    pub fw_id: FwId,
    pub launch_id: LaunchId,
    /// State recorded on the launch.
    pub state: FwState,
    pub executed: usize,
    pub cancelled: bool,
}

/// Cancellation probe backed by the engine's ownership check.
struct LaunchProbe<'a> {
    engine: &'a Engine,
    launch_id: LaunchId,
}

#[async_trait]
impl CancellationProbe for LaunchProbe<'_> {
    async fn should_continue(&self) -> bool {
        self.engine.should_continue(self.launch_id).await
    }
}

pub struct Rocket {
    engine: Arc<Engine>,
    registry: Arc<TaskRegistry>,
    worker: FWorker,
    config: RocketConfig,
}

impl Rocket {
    pub fn new(engine: Arc<Engine>, registry: Arc<TaskRegistry>, worker: FWorker, config: RocketConfig) -> Self {
        Self {
            engine,
            registry,
            worker,
            config,
        }
    }

    pub fn worker(&self) -> &FWorker {
        &self.worker
    }

    /// Claim and run a single firework. `None` when there is no work.
    #[instrument(skip(self), fields(worker = %self.worker.name))]
    pub async fn launch(&self) -> Result<Option<LaunchReport>, EngineError> {
        let Some(claim) = self.engine.claim(&self.worker).await? else {
            debug!("no READY firework for this worker");
            return Ok(None);
        };
        let (fw_id, launch_id) = (claim.fw_id, claim.launch_id);

        let launch_dir = self.config.launch_root.join(format!("launcher_{launch_id}"));
        if let Err(err) = tokio::fs::create_dir_all(&launch_dir).await {
            warn!(launch_id, error = %err, "cannot create launch dir; releasing reservation");
            let report = match self
                .engine
                .complete_launch(launch_id, FwAction::failure(format!("cannot create launch dir: {err}")))
                .await
            {
                Ok(report) => report,
                Err(err) => return lost_launch(fw_id, launch_id, 0, err),
            };
            return Ok(Some(LaunchReport {
                fw_id,
                launch_id,
                state: report.state,
                executed: 0,
                cancelled: false,
            }));
        }

        let runtime = RuntimeInfo {
            host: hostname(),
            ip: None,
            launch_dir: Some(launch_dir.display().to_string()),
        };
        let fw = match self.engine.mark_running(launch_id, runtime).await {
            Ok(fw) => fw,
            Err(err) => return lost_launch(fw_id, launch_id, 0, err),
        };

        let heartbeat = self.spawn_heartbeat(launch_id);
        let ctx = TaskContext {
            fw_id,
            launch_id,
            launch_dir: launch_dir.clone(),
            env: self.worker.env.clone(),
        };
        let probe = LaunchProbe {
            engine: &self.engine,
            launch_id,
        };
        let outcome = TaskPipeline::new(&self.registry, &self.config.pipeline)
            .run(fw.tasks(), &fw.spec.params, &ctx, &probe)
            .await;
        heartbeat.abort();

        let trackers = read_trackers(fw.spec.trackers(), &launch_dir).await;
        if !trackers.is_empty() {
            self.engine.update_trackers(launch_id, trackers).await?;
        }

        let report = match self.engine.complete_launch(launch_id, outcome.action).await {
            Ok(report) => report,
            Err(err) => return lost_launch(fw_id, launch_id, outcome.executed, err),
        };
        info!(fw_id, launch_id, state = %report.state, executed = outcome.executed, "launch done");
        Ok(Some(LaunchReport {
            fw_id,
            launch_id,
            state: report.state,
            executed: outcome.executed,
            cancelled: outcome.cancelled,
        }))
    }

    /// Keep launching until no work is left or `max_launches` is reached.
    pub async fn rapidfire(&self, max_launches: Option<usize>) -> Result<Vec<LaunchReport>, EngineError> {
        let mut reports = Vec::new();
        while max_launches.map_or(true, |max| reports.len() < max) {
            match self.launch().await? {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        info!(launches = reports.len(), "rapidfire finished");
        Ok(reports)
    }

    /// Poll for work until `shutdown` flips to true, sleeping between polls
    /// when idle.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> Result<usize, EngineError> {
        let mut launches = 0;
        while !*shutdown.borrow() {
            match self.launch().await {
                Ok(Some(_)) => {
                    launches += 1;
                    continue;
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "launch failed; retrying after the idle sleep");
                }
                Err(err) => return Err(err),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.idle_sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(launches, "worker loop stopped");
        Ok(launches)
    }

    fn spawn_heartbeat(&self, launch_id: LaunchId) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let period = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = engine.ping(launch_id).await {
                    debug!(launch_id, error = %err, "heartbeat stopped");
                    break;
                }
            }
        })
    }
}

/// The engine took the launch away (cancelled reservation, expired
/// reservation, lost run). Report it and let the loop carry on.
fn lost_launch(
    fw_id: FwId,
    launch_id: LaunchId,
    executed: usize,
    err: EngineError,
) -> Result<Option<LaunchReport>, EngineError> {
    match err {
        EngineError::LaunchNotActive { state, .. } | EngineError::LaunchAlreadyFinished { state, .. } => {
            warn!(fw_id, launch_id, %state, "launch was taken over by the engine; moving on");
            Ok(Some(LaunchReport {
                fw_id,
                launch_id,
                state,
                executed,
                cancelled: true,
            }))
        }
        other => Err(other),
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

/// Tail each tracked file; files that cannot be read are kept empty.
async fn read_trackers(mut trackers: Vec<Tracker>, launch_dir: &Path) -> Vec<Tracker> {
    for tracker in &mut trackers {
        match tokio::fs::read_to_string(launch_dir.join(&tracker.filename)).await {
            Ok(text) => tracker.capture(&text),
            Err(err) => debug!(file = %tracker.filename, error = %err, "tracker file unreadable"),
        }
    }
    trackers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{FireworkSpec, WorkflowSpec};
    use crate::config::EngineConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use store::{ChangeSet, MemoryStore, Snapshot, Store, StoreError};
    use tasks::mock::MockTask;
    use tasks::TaskDescriptor;
    use tokio::sync::Notify;

    /// Holds the next commit after `armed` is set until `release` fires.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Store for GatedStore {
        async fn load(&self) -> Result<Snapshot, StoreError> {
            self.inner.load().await
        }

        async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.commit(changes).await
        }
    }

    fn rocket_in(root: &Path, engine: Arc<Engine>, registry: TaskRegistry) -> Rocket {
        let config = RocketConfig {
            launch_root: root.to_path_buf(),
            ..RocketConfig::default()
        };
        Rocket::new(engine, Arc::new(registry), FWorker::default(), config)
    }

    fn echo_registry() -> (TaskRegistry, Arc<MockTask>) {
        let echo = Arc::new(MockTask::returning("Echo", json!({ "echoed": true })));
        let mut registry = TaskRegistry::with_builtins();
        registry.register("Echo", echo.clone());
        (registry, echo)
    }

    #[tokio::test]
    async fn launch_without_work_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let (registry, _) = echo_registry();
        let rocket = rocket_in(dir.path(), engine, registry);

        assert!(rocket.launch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rapidfire_drains_a_chain() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let (registry, echo) = echo_registry();

        let spec = WorkflowSpec::new("chain")
            .with_firework(FireworkSpec::new(1, "first").with_task(TaskDescriptor::new("Echo")))
            .with_firework(FireworkSpec::new(2, "second").with_task(TaskDescriptor::new("Echo")))
            .with_link(1, 2);
        let submitted = engine.submit(spec).await.unwrap();

        let rocket = rocket_in(dir.path(), Arc::clone(&engine), registry);
        let reports = rocket.rapidfire(None).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.state == FwState::Completed && r.executed == 1));
        assert_eq!(echo.call_count(), 2);

        let second = engine.firework(submitted.id_map[&2]).await.unwrap();
        assert_eq!(second.state, FwState::Completed);
        let launch = &second.launches[0];
        assert!(launch.launch_dir.as_deref().unwrap().contains("launcher_"));
        assert!(dir.path().join(format!("launcher_{}", launch.launch_id)).is_dir());
    }

    #[tokio::test]
    async fn rapidfire_respects_the_launch_limit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let (registry, _) = echo_registry();
        let mut spec = WorkflowSpec::new("fan");
        for id in 1..=3 {
            spec = spec.with_firework(FireworkSpec::new(id, format!("fw{id}")).with_task(TaskDescriptor::new("Echo")));
        }
        engine.submit(spec).await.unwrap();

        let rocket = rocket_in(dir.path(), Arc::clone(&engine), registry);
        assert_eq!(rocket.rapidfire(Some(2)).await.unwrap().len(), 2);
        assert_eq!(engine.fireworks_in_state(FwState::Ready).await.len(), 1);
    }

    #[tokio::test]
    async fn failing_task_fizzles_the_launch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let mut registry = TaskRegistry::new();
        registry.register("Boom", Arc::new(MockTask::failing_fatal("Boom", "disk full")));

        let spec = WorkflowSpec::from_firework(FireworkSpec::new(1, "boom").with_task(TaskDescriptor::new("Boom")));
        let submitted = engine.submit(spec).await.unwrap();

        let rocket = rocket_in(dir.path(), Arc::clone(&engine), registry);
        let report = rocket.launch().await.unwrap().unwrap();

        assert_eq!(report.state, FwState::Fizzled);
        let fw = engine.firework(submitted.id_map[&1]).await.unwrap();
        let detail = fw.launches[0].action.as_ref().and_then(|a| a.error_detail().map(str::to_owned));
        assert!(detail.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn trackers_capture_the_tail_of_launch_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let (registry, _) = echo_registry();

        let write = TaskDescriptor::new("FileWriteTask").with_param(
            "files_to_write",
            json!([{ "filename": "out.log", "contents": "one\ntwo\nthree\n" }]),
        );
        let spec = WorkflowSpec::from_firework(
            FireworkSpec::new(1, "tracked")
                .with_task(write)
                .with_param("_trackers", json!([{ "filename": "out.log", "nlines": 2 }])),
        );
        let submitted = engine.submit(spec).await.unwrap();

        let rocket = rocket_in(dir.path(), Arc::clone(&engine), registry);
        rocket.launch().await.unwrap().unwrap();

        let fw = engine.firework(submitted.id_map[&1]).await.unwrap();
        assert_eq!(fw.launches[0].trackers.len(), 1);
        assert_eq!(fw.launches[0].trackers[0].content, "two\nthree");
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let (registry, _) = echo_registry();
        let rocket = Arc::new(rocket_in(dir.path(), engine, registry));

        let (tx, rx) = watch::channel(false);
        let worker = Arc::clone(&rocket);
        let handle = tokio::spawn(async move { worker.run_until(rx).await });

        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn defuse_between_claim_and_start_does_not_stop_rapidfire() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatedStore::default());
        let engine = Arc::new(Engine::open(store.clone(), EngineConfig::default()).await.unwrap());
        let (registry, echo) = echo_registry();

        let spec = WorkflowSpec::new("pair")
            .with_firework(
                FireworkSpec::new(1, "urgent")
                    .with_task(TaskDescriptor::new("Echo"))
                    .with_param("_priority", json!(5)),
            )
            .with_firework(FireworkSpec::new(2, "routine").with_task(TaskDescriptor::new("Echo")));
        let submitted = engine.submit(spec).await.unwrap();
        let (urgent, routine) = (submitted.id_map[&1], submitted.id_map[&2]);

        // Hold the reservation of `urgent` in its commit.
        store.armed.store(true, Ordering::SeqCst);
        let rocket = Arc::new(rocket_in(dir.path(), Arc::clone(&engine), registry));
        let worker = Arc::clone(&rocket);
        let run = tokio::spawn(async move { worker.rapidfire(None).await });
        store.reached.notified().await;

        // The defuse queues on the arena ahead of the start signal.
        let operator = Arc::clone(&engine);
        let defuse = tokio::spawn(async move { operator.defuse(urgent).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        store.release.notify_one();

        assert!(defuse.await.unwrap().unwrap());
        let reports = run.await.unwrap().unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].fw_id, urgent);
        assert!(reports[0].cancelled);
        assert_eq!(reports[0].state, FwState::Fizzled);
        assert_eq!(reports[0].executed, 0);
        assert_eq!(reports[1].fw_id, routine);
        assert_eq!(reports[1].state, FwState::Completed);

        assert_eq!(engine.firework(urgent).await.unwrap().state, FwState::Defused);
        assert_eq!(engine.firework(routine).await.unwrap().state, FwState::Completed);
        assert_eq!(echo.call_count(), 1);
    }

    #[tokio::test]
    async fn run_until_retries_after_a_failed_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::open(store.clone(), EngineConfig::default()).await.unwrap());
        let (registry, echo) = echo_registry();
        let spec = WorkflowSpec::from_firework(FireworkSpec::new(1, "once").with_task(TaskDescriptor::new("Echo")));
        let fw_id = engine.submit(spec).await.unwrap().id_map[&1];

        store.fail_next_commits(1);
        let config = RocketConfig {
            launch_root: dir.path().to_path_buf(),
            idle_sleep: Duration::from_millis(5),
            ..RocketConfig::default()
        };
        let rocket = Arc::new(Rocket::new(Arc::clone(&engine), Arc::new(registry), FWorker::default(), config));

        let (tx, rx) = watch::channel(false);
        let worker = Arc::clone(&rocket);
        let handle = tokio::spawn(async move { worker.run_until(rx).await });

        while engine.firework(fw_id).await.unwrap().state != FwState::Completed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(echo.call_count(), 1);
    }
}
