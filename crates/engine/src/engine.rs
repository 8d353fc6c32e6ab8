//! `Engine` — the shared, transactional owner of every workflow.
//!
//! All state lives in one arena behind an async mutex. Each mutating call:
//! 1. stages its changes in a [`Txn`] over the arena,
//! 2. commits the staged rows to the [`Store`] in one atomic write,
//! 3. applies them to the arena only if the commit succeeded.
//!
//! Readers get cloned values. Claims pick candidates from a snapshot and
//! then compare-and-swap inside a transaction, so concurrent workers never
//! share a firework.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use store::{MemoryStore, Store};
use tasks::FwAction;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::compose::WorkflowSpec;
use crate::config::{to_chrono, EngineConfig};
use crate::lifecycle::{Claim, CompletionReport, Insertion, RuntimeInfo, StalledBranch, Submitted};
use crate::models::{timestamp, FWorker, Firework, FwId, FwState, Launch, LaunchId, Tracker, WfId, Workflow};
use crate::txn::{Arena, Txn};
use crate::EngineError;

pub struct Engine {
    arena: Mutex<Arena>,
    store: Arc<dyn Store>,
    config: EngineConfig,
}

impl Engine {
    /// Rebuild an engine from everything `store` holds.
    pub async fn open(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self, EngineError> {
        let snapshot = store.load().await?;
        let arena = Arena::from_snapshot(snapshot)?;
        info!(
            workflows = arena.workflows.len(),
            fireworks = arena.fireworks.len(),
            "engine state recovered from store"
        );
        Ok(Self {
            arena: Mutex::new(arena),
            store,
            config,
        })
    }

    /// An empty engine over a fresh [`MemoryStore`].
    pub fn in_memory(config: EngineConfig) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            store: Arc::new(MemoryStore::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Internal: run one transaction
    // -----------------------------------------------------------------------

    async fn transact<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Txn<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut arena = self.arena.lock().await;

        let (out, staged) = {
            let mut txn = Txn::new(&arena, &self.config, timestamp::now());
            let out = f(&mut txn)?;
            (out, txn.finish()?)
        };
        if staged.is_empty() {
            return Ok(out);
        }

        let changes = staged.to_changeset()?;
        if let Err(err) = self.store.commit(&changes).await {
            error!(op, error = %err, "commit failed; transaction discarded");
            return Err(err.into());
        }
        arena.apply(staged);
        debug!(op, fireworks = changes.fireworks.len(), "transaction committed");
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Validate and register a workflow. Roots start READY.
    #[instrument(skip_all, fields(name = %spec.name))]
    pub async fn submit(&self, spec: WorkflowSpec) -> Result<Submitted, EngineError> {
        let submitted = self.transact("submit", move |txn| txn.submit(spec)).await?;
        info!(
            wf_id = submitted.wf_id,
            fireworks = submitted.id_map.len(),
            "workflow submitted"
        );
        Ok(submitted)
    }

    /// Splice new fireworks into a live workflow.
    #[instrument(skip(self, insertion), fields(parents = ?insertion.parents, children = ?insertion.children))]
    pub async fn insert_workflow(
        &self,
        wf_id: WfId,
        insertion: Insertion,
    ) -> Result<BTreeMap<FwId, FwId>, EngineError> {
        let ids = self
            .transact("insert_workflow", move |txn| txn.insert(wf_id, insertion))
            .await?;
        info!(wf_id, inserted = ids.len(), "fireworks inserted");
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Worker protocol
    // -----------------------------------------------------------------------

    /// Reserve the best READY firework `worker` accepts. `None` means there
    /// is no work for this worker right now.
    #[instrument(skip_all, fields(worker = %worker.name))]
    pub async fn claim(&self, worker: &FWorker) -> Result<Option<Claim>, EngineError> {
        let candidates = self.arena.lock().await.ready_candidates(worker);
        let mut conflicts = 0u32;

        for fw_id in candidates {
            match self.transact("claim", |txn| txn.reserve(fw_id, worker)).await {
                Ok(claim) => {
                    info!(fw_id, launch_id = claim.launch_id, "firework reserved");
                    return Ok(Some(claim));
                }
                Err(EngineError::ClaimConflict { fw_id, found }) => {
                    conflicts += 1;
                    debug!(fw_id, %found, "lost the race for a firework");
                    if conflicts > self.config.claim_retries {
                        warn!(conflicts, "giving up on claim after repeated conflicts");
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// The worker started the launch: RESERVED → RUNNING.
    #[instrument(skip(self, runtime))]
    pub async fn mark_running(&self, launch_id: LaunchId, runtime: RuntimeInfo) -> Result<Firework, EngineError> {
        let fw = self
            .transact("mark_running", move |txn| txn.start(launch_id, runtime))
            .await?;
        info!(fw_id = fw.fw_id, "launch running");
        Ok(fw)
    }

    /// Heartbeat for a RUNNING launch.
    pub async fn ping(&self, launch_id: LaunchId) -> Result<(), EngineError> {
        self.transact("ping", move |txn| txn.ping(launch_id)).await
    }

    /// Replace the placeholder reservation id with the queue's job id.
    #[instrument(skip(self))]
    pub async fn set_reservation_id(
        &self,
        launch_id: LaunchId,
        reservation_id: String,
    ) -> Result<(), EngineError> {
        self.transact("set_reservation_id", move |txn| {
            txn.set_reservation_id(launch_id, reservation_id)
        })
        .await
    }

    pub async fn update_trackers(&self, launch_id: LaunchId, trackers: Vec<Tracker>) -> Result<(), EngineError> {
        self.transact("update_trackers", move |txn| txn.update_trackers(launch_id, trackers))
            .await
    }

    /// Fold the launch's final action into firework and workflow state.
    #[instrument(skip(self, action), fields(outcome = ?action.outcome))]
    pub async fn complete_launch(
        &self,
        launch_id: LaunchId,
        action: FwAction,
    ) -> Result<CompletionReport, EngineError> {
        let report = self
            .transact("complete_launch", move |txn| txn.complete(launch_id, action))
            .await?;

        if !report.applied {
            info!(fw_id = report.fw_id, state = %report.state, "completion recorded without touching the firework");
        } else {
            info!(
                fw_id = report.fw_id,
                state = %report.state,
                newly_ready = ?report.newly_ready,
                inserted = report.inserted.len(),
                rerun = report.rerun,
                "launch finished"
            );
        }
        if !report.blocked_children.is_empty() {
            warn!(
                fw_id = report.fw_id,
                blocked = ?report.blocked_children,
                "fizzled firework leaves children waiting"
            );
        }
        Ok(report)
    }

    /// Whether the launch still owns a RUNNING firework. The task pipeline
    /// asks before every task.
    pub async fn should_continue(&self, launch_id: LaunchId) -> bool {
        let arena = self.arena.lock().await;
        match arena.launch(launch_id) {
            Some((fw, launch)) => launch.state == FwState::Running && fw.is_owned_by(launch_id),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // TTL recovery
    // -----------------------------------------------------------------------

    pub async fn detect_unreserved(&self) -> Result<Vec<LaunchId>, EngineError> {
        self.detect_unreserved_at(timestamp::now()).await
    }

    /// Revert every reservation older than the reservation ttl at `now`.
    #[instrument(skip(self))]
    pub async fn detect_unreserved_at(&self, now: DateTime<Utc>) -> Result<Vec<LaunchId>, EngineError> {
        let Some(cutoff) = now.checked_sub_signed(to_chrono(self.config.reservation_ttl)) else {
            return Ok(Vec::new());
        };
        let stale = self
            .arena
            .lock()
            .await
            .stale_launches(FwState::Reserved, cutoff);

        let mut reverted = Vec::new();
        for launch_id in stale {
            let done = self
                .transact("detect_unreserved", |txn| txn.revert_stale_reservation(launch_id, cutoff))
                .await?;
            if done {
                warn!(launch_id, "stale reservation reverted; firework READY again");
                reverted.push(launch_id);
            }
        }
        Ok(reverted)
    }

    pub async fn detect_lostruns(&self) -> Result<Vec<LaunchId>, EngineError> {
        self.detect_lostruns_at(timestamp::now()).await
    }

    /// Fizzle every RUNNING launch without a heartbeat for the lost-run ttl.
    #[instrument(skip(self))]
    pub async fn detect_lostruns_at(&self, now: DateTime<Utc>) -> Result<Vec<LaunchId>, EngineError> {
        let Some(cutoff) = now.checked_sub_signed(to_chrono(self.config.lostrun_ttl)) else {
            return Ok(Vec::new());
        };
        let lost = self
            .arena
            .lock()
            .await
            .stale_launches(FwState::Running, cutoff);

        let mut fizzled = Vec::new();
        for launch_id in lost {
            let report = self
                .transact("detect_lostruns", |txn| txn.fizzle_lost_run(launch_id, cutoff))
                .await?;
            if let Some(report) = report {
                warn!(launch_id, fw_id = report.fw_id, rerun = report.rerun, "lost run fizzled");
                fizzled.push(launch_id);
            }
        }
        Ok(fizzled)
    }

    // -----------------------------------------------------------------------
    // Operator commands
    // -----------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn rerun(&self, fw_id: FwId) -> Result<(), EngineError> {
        self.transact("rerun", move |txn| txn.rerun(fw_id)).await?;
        info!("firework rerun");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn defuse(&self, fw_id: FwId) -> Result<bool, EngineError> {
        self.transact("defuse", move |txn| txn.defuse(fw_id)).await
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, fw_id: FwId) -> Result<bool, EngineError> {
        self.transact("pause", move |txn| txn.pause(fw_id)).await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, fw_id: FwId) -> Result<bool, EngineError> {
        self.transact("resume", move |txn| txn.resume(fw_id)).await
    }

    #[instrument(skip(self))]
    pub async fn reignite(&self, fw_id: FwId) -> Result<bool, EngineError> {
        self.transact("reignite", move |txn| txn.reignite(fw_id)).await
    }

    #[instrument(skip(self))]
    pub async fn archive(&self, fw_id: FwId) -> Result<bool, EngineError> {
        self.transact("archive", move |txn| txn.archive(fw_id)).await
    }

    #[instrument(skip(self))]
    pub async fn defuse_workflow(&self, wf_id: WfId) -> Result<usize, EngineError> {
        let defused = self
            .transact("defuse_workflow", move |txn| txn.defuse_workflow(wf_id))
            .await?;
        info!(defused, "workflow defused");
        Ok(defused)
    }

    #[instrument(skip(self))]
    pub async fn set_priority(&self, fw_id: FwId, priority: f64) -> Result<(), EngineError> {
        self.transact("set_priority", move |txn| txn.set_priority(fw_id, priority))
            .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn firework(&self, fw_id: FwId) -> Option<Firework> {
        self.arena.lock().await.fireworks.get(&fw_id).cloned()
    }

    pub async fn workflow(&self, wf_id: WfId) -> Option<Workflow> {
        self.arena.lock().await.workflows.get(&wf_id).cloned()
    }

    pub async fn workflow_of(&self, fw_id: FwId) -> Option<WfId> {
        self.arena.lock().await.workflow_of(fw_id)
    }

    pub async fn launch(&self, launch_id: LaunchId) -> Option<Launch> {
        let arena = self.arena.lock().await;
        arena.launch(launch_id).map(|(_, launch)| launch.clone())
    }

    pub async fn workflow_ids(&self) -> Vec<WfId> {
        self.arena.lock().await.workflows.keys().copied().collect()
    }

    pub async fn fireworks_in_state(&self, state: FwState) -> Vec<FwId> {
        self.arena
            .lock()
            .await
            .fireworks
            .values()
            .filter(|fw| fw.state == state)
            .map(|fw| fw.fw_id)
            .collect()
    }

    /// Fizzled members of `wf_id` that hold back WAITING children.
    pub async fn stalled_branches(&self, wf_id: WfId) -> Result<Vec<StalledBranch>, EngineError> {
        let arena = self.arena.lock().await;
        let wf = arena
            .workflows
            .get(&wf_id)
            .ok_or(EngineError::WorkflowNotFound(wf_id))?;
        let state = |id: &FwId| arena.fireworks.get(id).map(|fw| fw.state);

        Ok(wf
            .nodes
            .iter()
            .filter(|id| state(id) == Some(FwState::Fizzled))
            .filter_map(|&fizzled| {
                let blocked: Vec<FwId> = wf
                    .children(fizzled)
                    .iter()
                    .copied()
                    .filter(|child| state(child) == Some(FwState::Waiting))
                    .collect();
                (!blocked.is_empty()).then_some(StalledBranch { fizzled, blocked })
            })
            .collect())
    }
}
