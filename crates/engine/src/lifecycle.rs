//! Firework lifecycle operations, run inside a [`Txn`].
//!
//! Every public engine call maps to one method here. Methods validate
//! before they mutate where they can, but correctness does not depend on
//! it: an `Err` discards the whole transaction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tasks::{FwAction, Spec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compose::{FireworkSpec, WorkflowSpec};
use crate::dag::{check_insertion, validate_dag};
use crate::dict_mod::{apply_mod, deep_merge, validate_mod};
use crate::error::StructuralError;
use crate::models::firework::{PRIORITY_KEY, TASKS_KEY};
use crate::models::{FWorker, Firework, FwId, FwState, Launch, LaunchId, Tracker, WfId, Workflow};
use crate::txn::Txn;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Results of engine operations
// ---------------------------------------------------------------------------

/// A submitted workflow and the local → global firework id mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submitted {
    pub wf_id: WfId,
    pub id_map: BTreeMap<FwId, FwId>,
}

/// A successful reservation handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub fw_id: FwId,
    pub launch_id: LaunchId,
    pub reservation_id: String,
    /// The firework as reserved; the worker runs `firework.spec._tasks`.
    pub firework: Firework,
}

/// Where a launch is running, reported by the worker when it starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub launch_dir: Option<String>,
}

/// New fireworks to splice into a live workflow.
///
/// The fragment's roots become children of every `parents` node and its
/// leaves become parents of every `children` node. Direct links from
/// `parents` to `children` are replaced by the fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insertion {
    pub workflow: WorkflowSpec,
    #[serde(default)]
    pub parents: Vec<FwId>,
    #[serde(default)]
    pub children: Vec<FwId>,
}

/// What a `complete_launch` call did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub fw_id: FwId,
    pub launch_id: LaunchId,
    /// State recorded on the launch.
    pub state: FwState,
    /// False for a repeated report or a late result after cancellation.
    pub applied: bool,
    pub newly_ready: Vec<FwId>,
    /// Global ids of fireworks added by `additions` and `detours`.
    pub inserted: Vec<FwId>,
    /// Children left WAITING behind a fizzled parent.
    pub blocked_children: Vec<FwId>,
    /// The rerun policy put the firework back to WAITING.
    pub rerun: bool,
}

impl CompletionReport {
    fn new(fw_id: FwId, launch_id: LaunchId, state: FwState) -> Self {
        Self {
            fw_id,
            launch_id,
            state,
            applied: false,
            newly_ready: Vec::new(),
            inserted: Vec::new(),
            blocked_children: Vec::new(),
            rerun: false,
        }
    }
}

/// A fizzled firework and the children waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledBranch {
    pub fizzled: FwId,
    pub blocked: Vec<FwId>,
}

/// Validated downstream effects of a successful action.
#[derive(Debug, Default)]
struct ActionPlan {
    updated_specs: Vec<(FwId, Spec)>,
    additions: Vec<WorkflowSpec>,
    detours: Vec<WorkflowSpec>,
}

const UNNAMED: &str = "Unnamed FW";

impl Txn<'_> {
    // -----------------------------------------------------------------------
    // Submission & insertion
    // -----------------------------------------------------------------------

    pub(crate) fn submit(&mut self, spec: WorkflowSpec) -> Result<Submitted, EngineError> {
        let order = validate_dag(&spec)?;
        let wf_id = self.alloc_wf_id();
        let mut workflow = Workflow::new(wf_id, spec.name.clone(), self.now());
        workflow.metadata = spec.metadata.clone();

        let (id_map, globals, links) = self.materialize(wf_id, spec, &order);
        for &fw_id in &globals {
            workflow.add_node(fw_id, FwState::Waiting);
        }
        for (parent, child) in links {
            workflow.add_link(parent, child);
        }
        self.insert_workflow(workflow);

        for &fw_id in &globals {
            self.refresh_readiness(fw_id)?;
        }
        Ok(Submitted { wf_id, id_map })
    }

    /// Allocate global ids in topological order and stage one WAITING
    /// firework per entry. Returns the id map, the new ids in order and the
    /// fragment's internal links translated to global ids.
    fn materialize(
        &mut self,
        wf_id: WfId,
        spec: WorkflowSpec,
        order: &[FwId],
    ) -> (BTreeMap<FwId, FwId>, Vec<FwId>, Vec<(FwId, FwId)>) {
        let mut id_map = BTreeMap::new();
        let mut globals = Vec::with_capacity(order.len());
        for &local in order {
            let global = self.alloc_fw_id();
            id_map.insert(local, global);
            globals.push(global);
        }

        let links: Vec<(FwId, FwId)> = spec
            .links
            .iter()
            .flat_map(|(parent, children)| {
                let id_map = &id_map;
                children.iter().map(move |child| (id_map[parent], id_map[child]))
            })
            .collect();

        let now = self.now();
        let mut by_local: HashMap<FwId, FireworkSpec> =
            spec.fireworks.into_iter().map(|fw| (fw.fw_id, fw)).collect();
        for local in order {
            if let Some(fw_spec) = by_local.remove(local) {
                let name = if fw_spec.name.is_empty() {
                    UNNAMED.to_owned()
                } else {
                    fw_spec.name
                };
                self.insert_firework(wf_id, Firework::new(id_map[local], name, fw_spec.spec, now));
            }
        }
        (id_map, globals, links)
    }

    pub(crate) fn insert(
        &mut self,
        wf_id: WfId,
        insertion: Insertion,
    ) -> Result<BTreeMap<FwId, FwId>, EngineError> {
        let Insertion {
            workflow: fragment,
            parents,
            children,
        } = insertion;

        let order = validate_dag(&fragment)?;
        check_insertion(self.workflow(wf_id)?, &parents, &children)?;
        for &child in &children {
            let state = self.state_of(child)?;
            if state.has_started() {
                return Err(EngineError::InvalidTransition {
                    fw_id: child,
                    from: state,
                    to: FwState::Waiting,
                });
            }
        }

        let roots = fragment.root_ids();
        let leaves = fragment.leaf_ids();
        let (id_map, globals, links) = self.materialize(wf_id, fragment, &order);

        let now = self.now();
        let wf = self.workflow_mut(wf_id)?;
        for &fw_id in &globals {
            wf.add_node(fw_id, FwState::Waiting);
        }
        for (parent, child) in links {
            wf.add_link(parent, child);
        }
        for &parent in &parents {
            for &child in &children {
                wf.remove_link(parent, child);
            }
            for root in &roots {
                wf.add_link(parent, id_map[root]);
            }
        }
        for leaf in &leaves {
            for &child in &children {
                wf.add_link(id_map[leaf], child);
            }
        }
        wf.updated_on = now;

        for &fw_id in globals.iter().chain(&children) {
            self.refresh_readiness(fw_id)?;
        }
        debug!(wf_id, inserted = globals.len(), "fragment spliced into workflow");
        Ok(id_map)
    }

    // -----------------------------------------------------------------------
    // Readiness (AND-join)
    // -----------------------------------------------------------------------

    pub(crate) fn parents_satisfied(&self, fw_id: FwId) -> Result<bool, EngineError> {
        let allow_fizzled = self.firework(fw_id)?.spec.allows_fizzled_parents();
        for parent in self.workflow_for(fw_id)?.parents(fw_id) {
            match self.state_of(parent)? {
                FwState::Completed => {}
                FwState::Fizzled if allow_fizzled => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// WAITING → READY once every parent is done; READY → WAITING when a
    /// parent is no longer done. Other states are left alone.
    pub(crate) fn refresh_readiness(&mut self, fw_id: FwId) -> Result<bool, EngineError> {
        match self.state_of(fw_id)? {
            FwState::Waiting if self.parents_satisfied(fw_id)? => {
                self.transition(fw_id, FwState::Ready)
            }
            FwState::Ready if !self.parents_satisfied(fw_id)? => {
                self.transition(fw_id, FwState::Waiting)
            }
            _ => Ok(false),
        }
    }

    /// Recompute readiness of the direct children of `fw_id` once it has
    /// settled. Returns the children now READY and those left WAITING.
    pub(crate) fn on_node_terminal(&mut self, fw_id: FwId) -> Result<(Vec<FwId>, Vec<FwId>), EngineError> {
        let children = self.workflow_for(fw_id)?.children(fw_id).to_vec();
        let (mut ready, mut waiting) = (Vec::new(), Vec::new());
        for child in children {
            self.refresh_readiness(child)?;
            match self.state_of(child)? {
                FwState::Ready => ready.push(child),
                FwState::Waiting => waiting.push(child),
                _ => {}
            }
        }
        Ok((ready, waiting))
    }

    // -----------------------------------------------------------------------
    // Reservation & start
    // -----------------------------------------------------------------------

    /// Compare-and-swap READY → RESERVED for `worker`.
    pub(crate) fn reserve(&mut self, fw_id: FwId, worker: &FWorker) -> Result<Claim, EngineError> {
        let fw = self.firework(fw_id)?;
        if fw.state != FwState::Ready || !worker.matches(fw) {
            return Err(EngineError::ClaimConflict {
                fw_id,
                found: fw.state,
            });
        }

        let launch_id = self.alloc_launch_id();
        let reservation_id = Uuid::new_v4().simple().to_string();
        let launch = Launch::reserved(
            launch_id,
            fw_id,
            worker.clone(),
            reservation_id.clone(),
            self.now(),
        );
        self.transition(fw_id, FwState::Reserved)?;
        self.add_launch(launch)?;

        Ok(Claim {
            fw_id,
            launch_id,
            reservation_id,
            firework: self.firework(fw_id)?.clone(),
        })
    }

    /// RESERVED → RUNNING on the worker's start signal. A repeated signal
    /// only refreshes the heartbeat.
    pub(crate) fn start(&mut self, launch_id: LaunchId, info: RuntimeInfo) -> Result<Firework, EngineError> {
        let now = self.now();
        let (fw, launch) = self.launch(launch_id)?;
        let (fw_id, launch_state) = (fw.fw_id, launch.state);
        if !fw.is_owned_by(launch_id) {
            return Err(EngineError::LaunchNotActive {
                launch_id,
                state: launch_state,
            });
        }

        if launch_state == FwState::Reserved {
            self.transition(fw_id, FwState::Running)?;
        }
        let launch = self.launch_mut(launch_id)?;
        launch.set_state(FwState::Running, now, None);
        if info.host.is_some() {
            launch.host = info.host;
        }
        if info.ip.is_some() {
            launch.ip = info.ip;
        }
        if info.launch_dir.is_some() {
            launch.launch_dir = info.launch_dir;
        }
        Ok(self.firework(fw_id)?.clone())
    }

    pub(crate) fn ping(&mut self, launch_id: LaunchId) -> Result<(), EngineError> {
        let now = self.now();
        let (fw, launch) = self.launch(launch_id)?;
        if launch.state != FwState::Running || !fw.is_owned_by(launch_id) {
            return Err(EngineError::LaunchNotActive {
                launch_id,
                state: launch.state,
            });
        }
        self.launch_mut(launch_id)?.touch(now);
        Ok(())
    }

    pub(crate) fn set_reservation_id(
        &mut self,
        launch_id: LaunchId,
        reservation_id: String,
    ) -> Result<(), EngineError> {
        let (fw, launch) = self.launch(launch_id)?;
        if launch.state != FwState::Reserved || !fw.is_owned_by(launch_id) {
            return Err(EngineError::LaunchNotActive {
                launch_id,
                state: launch.state,
            });
        }
        self.launch_mut(launch_id)?.set_reservation_id(reservation_id);
        Ok(())
    }

    pub(crate) fn update_trackers(
        &mut self,
        launch_id: LaunchId,
        trackers: Vec<Tracker>,
    ) -> Result<(), EngineError> {
        self.launch_mut(launch_id)?.trackers = trackers;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    pub(crate) fn complete(
        &mut self,
        launch_id: LaunchId,
        action: FwAction,
    ) -> Result<CompletionReport, EngineError> {
        let now = self.now();
        let (fw, launch) = self.launch(launch_id)?;
        let (fw_id, fw_state, launch_state) = (fw.fw_id, fw.state, launch.state);
        let owned = fw.is_owned_by(launch_id);
        let target = if action.is_success() {
            FwState::Completed
        } else {
            FwState::Fizzled
        };
        let mut report = CompletionReport::new(fw_id, launch_id, launch_state);

        match launch_state {
            state if state == target => {
                debug!(launch_id, %state, "outcome already recorded");
                return Ok(report);
            }
            FwState::Completed | FwState::Fizzled => {
                return Err(EngineError::LaunchAlreadyFinished {
                    launch_id,
                    state: launch_state,
                });
            }
            FwState::Reserved if action.is_success() => {
                return Err(EngineError::LaunchNotActive {
                    launch_id,
                    state: launch_state,
                });
            }
            _ => {}
        }

        if !owned {
            // The firework was defused or paused while this launch ran.
            let cancelled = FwAction::failure(format!("launch cancelled: firework is {fw_state}"))
                .with_stored_data("_reported_action", serde_json::to_value(&action)?);
            self.launch_mut(launch_id)?
                .finish(FwState::Fizzled, cancelled, now);
            report.state = FwState::Fizzled;
            return Ok(report);
        }

        report.applied = true;
        if launch_state == FwState::Reserved {
            // The worker gave up before starting; the firework is claimable again.
            self.launch_mut(launch_id)?
                .finish(FwState::Fizzled, action, now);
            self.transition(fw_id, FwState::Ready)?;
            report.state = FwState::Fizzled;
        } else if action.is_success() {
            self.complete_success(fw_id, launch_id, action, &mut report)?;
        } else {
            self.fizzle(fw_id, launch_id, action, &mut report)?;
        }
        Ok(report)
    }

    fn complete_success(
        &mut self,
        fw_id: FwId,
        launch_id: LaunchId,
        action: FwAction,
        report: &mut CompletionReport,
    ) -> Result<(), EngineError> {
        let plan = match self.plan_action(fw_id, &action) {
            Ok(plan) => plan,
            Err(EngineError::Structural(err)) => {
                warn!(fw_id, launch_id, error = %err, "rejecting structurally invalid action");
                let rejected = FwAction::failure(format!("invalid action: {err}"))
                    .with_stored_data("_rejected_action", serde_json::to_value(&action)?);
                return self.fizzle(fw_id, launch_id, rejected, report);
            }
            Err(err) => return Err(err),
        };

        let now = self.now();
        let wf_id = self.wf_id_of(fw_id)?;
        let original_children = self.workflow(wf_id)?.children(fw_id).to_vec();
        let (defuse_children, defuse_workflow) = (action.defuse_children, action.defuse_workflow);

        self.launch_mut(launch_id)?
            .finish(FwState::Completed, action, now);
        self.transition(fw_id, FwState::Completed)?;
        report.state = FwState::Completed;

        for (target, params) in plan.updated_specs {
            let fw = self.firework_mut(target)?;
            fw.spec.params = params;
            fw.updated_on = now;
        }

        if defuse_children {
            for &child in &original_children {
                if matches!(self.state_of(child)?, FwState::Waiting | FwState::Ready | FwState::Paused) {
                    self.transition(child, FwState::Defused)?;
                }
            }
        }
        if defuse_workflow {
            let nodes = self.workflow(wf_id)?.nodes.clone();
            for node in nodes {
                if !matches!(
                    self.state_of(node)?,
                    FwState::Completed | FwState::Defused | FwState::Archived
                ) {
                    self.defuse(node)?;
                }
            }
        }

        for addition in plan.additions {
            let ids = self.insert(
                wf_id,
                Insertion {
                    workflow: addition,
                    parents: vec![fw_id],
                    children: Vec::new(),
                },
            )?;
            report.inserted.extend(ids.values());
        }
        for detour in plan.detours {
            let ids = self.insert(
                wf_id,
                Insertion {
                    workflow: detour,
                    parents: vec![fw_id],
                    children: original_children.clone(),
                },
            )?;
            report.inserted.extend(ids.values());
        }

        let (ready, _) = self.on_node_terminal(fw_id)?;
        report.newly_ready.extend(ready);
        Ok(())
    }

    /// Validate an action's downstream effects against the current graph
    /// and compute the updated specs, touching nothing.
    fn plan_action(&self, fw_id: FwId, action: &FwAction) -> Result<ActionPlan, EngineError> {
        let wf = self.workflow_for(fw_id)?;
        let mut plan = ActionPlan::default();

        for modification in &action.mod_spec {
            validate_mod(modification).map_err(StructuralError::from)?;
        }

        if action.updates_downstream() {
            let targets: Vec<FwId> = if !action.update_targets.is_empty() {
                let descendants = wf.descendants(fw_id);
                if let Some(&target) = action.update_targets.iter().find(|t| !descendants.contains(*t)) {
                    return Err(StructuralError::BadUpdateTarget { fw_id, target }.into());
                }
                action.update_targets.clone()
            } else if action.propagate {
                wf.descendants(fw_id).into_iter().collect()
            } else {
                wf.children(fw_id).to_vec()
            };

            for target in targets {
                let fw = self.firework(target)?;
                if fw.state.has_started() {
                    debug!(fw_id, target, state = %fw.state, "not updating a started firework");
                    continue;
                }
                let mut params = fw.spec.params.clone();
                deep_merge(&mut params, &action.update_spec);
                for modification in &action.mod_spec {
                    apply_mod(&mut params, modification).map_err(StructuralError::from)?;
                }
                params.remove(TASKS_KEY);
                plan.updated_specs.push((target, params));
            }
        }

        for raw in &action.additions {
            let fragment = WorkflowSpec::from_value(raw)?;
            validate_dag(&fragment)?;
            plan.additions.push(fragment);
        }
        for raw in &action.detours {
            let fragment = WorkflowSpec::from_value(raw)?;
            validate_dag(&fragment)?;
            plan.detours.push(fragment);
        }
        Ok(plan)
    }

    /// Record a failed launch, leave children waiting and apply the rerun
    /// policy.
    fn fizzle(
        &mut self,
        fw_id: FwId,
        launch_id: LaunchId,
        action: FwAction,
        report: &mut CompletionReport,
    ) -> Result<(), EngineError> {
        let now = self.now();
        self.launch_mut(launch_id)?
            .finish(FwState::Fizzled, action, now);
        self.transition(fw_id, FwState::Fizzled)?;
        report.state = FwState::Fizzled;

        let fw = self.firework(fw_id)?;
        let limit = fw
            .spec
            .max_reruns()
            .unwrap_or(self.config().rerun.max_auto_reruns);
        let failures = fw.failed_runs();
        if failures <= limit as usize {
            info!(fw_id, failures, limit, "rerunning fizzled firework automatically");
            self.rerun(fw_id)?;
            report.rerun = true;
        }

        let (ready, waiting) = self.on_node_terminal(fw_id)?;
        report.newly_ready.extend(ready);
        if !report.rerun {
            report.blocked_children = waiting;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // TTL recovery
    // -----------------------------------------------------------------------

    /// Revert a RESERVED launch that went stale before `cutoff`. Returns
    /// false when the launch started or finished in the meantime.
    pub(crate) fn revert_stale_reservation(
        &mut self,
        launch_id: LaunchId,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        let (fw, launch) = self.launch(launch_id)?;
        let stale = launch.state == FwState::Reserved
            && fw.is_owned_by(launch_id)
            && launch.last_update().is_some_and(|t| t < cutoff);
        if !stale {
            return Ok(false);
        }
        let fw_id = fw.fw_id;

        let action = FwAction::failure(format!(
            "reservation expired: launch {launch_id} was not started within the reservation ttl"
        ))
        .with_stored_data("_reservation_timeout", json!(true));
        self.launch_mut(launch_id)?
            .finish(FwState::Fizzled, action, now);
        self.transition(fw_id, FwState::Ready)?;
        self.refresh_readiness(fw_id)?;
        Ok(true)
    }

    /// Fizzle a RUNNING launch whose heartbeat stopped before `cutoff`.
    pub(crate) fn fizzle_lost_run(
        &mut self,
        launch_id: LaunchId,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<CompletionReport>, EngineError> {
        let now = self.now();
        let (fw, launch) = self.launch(launch_id)?;
        let lost = launch.state == FwState::Running
            && launch.last_update().is_some_and(|t| t < cutoff);
        if !lost {
            return Ok(None);
        }
        let (fw_id, fw_state, owned) = (fw.fw_id, fw.state, fw.is_owned_by(launch_id));

        let action = FwAction::failure(format!(
            "lost run: launch {launch_id} sent no heartbeat within the lost-run ttl"
        ))
        .with_stored_data("_lost_run", json!(true));
        let mut report = CompletionReport::new(fw_id, launch_id, FwState::Running);

        if !owned {
            // Paused or defused under the launch: close the launch only.
            let cancelled = action.with_stored_data("_cancelled_under", json!(fw_state));
            self.launch_mut(launch_id)?
                .finish(FwState::Fizzled, cancelled, now);
            report.state = FwState::Fizzled;
            return Ok(Some(report));
        }

        report.applied = true;
        self.fizzle(fw_id, launch_id, action, &mut report)?;
        Ok(Some(report))
    }

    // -----------------------------------------------------------------------
    // Operator commands
    // -----------------------------------------------------------------------

    /// FIZZLED or COMPLETED → WAITING (READY when parents allow), resetting
    /// started descendants. Launch history is kept.
    pub(crate) fn rerun(&mut self, fw_id: FwId) -> Result<(), EngineError> {
        let state = self.state_of(fw_id)?;
        if !matches!(state, FwState::Fizzled | FwState::Completed) {
            return Err(EngineError::InvalidTransition {
                fw_id,
                from: state,
                to: FwState::Waiting,
            });
        }

        let descendants = self.workflow_for(fw_id)?.descendants(fw_id);
        for &node in &descendants {
            let node_state = self.state_of(node)?;
            if node_state.is_active() {
                return Err(EngineError::InvalidTransition {
                    fw_id: node,
                    from: node_state,
                    to: FwState::Waiting,
                });
            }
        }

        self.transition(fw_id, FwState::Waiting)?;
        for node in descendants {
            if matches!(
                self.state_of(node)?,
                FwState::Ready | FwState::Completed | FwState::Fizzled
            ) {
                self.transition(node, FwState::Waiting)?;
            }
        }
        self.refresh_readiness(fw_id)?;
        Ok(())
    }

    pub(crate) fn defuse(&mut self, fw_id: FwId) -> Result<bool, EngineError> {
        match self.state_of(fw_id)? {
            FwState::Defused => Ok(false),
            FwState::Reserved => {
                self.cancel_reservation(fw_id, FwState::Defused)?;
                self.settle(fw_id, FwState::Defused)
            }
            _ => self.settle(fw_id, FwState::Defused),
        }
    }

    pub(crate) fn pause(&mut self, fw_id: FwId) -> Result<bool, EngineError> {
        match self.state_of(fw_id)? {
            FwState::Paused => Ok(false),
            FwState::Reserved => {
                self.cancel_reservation(fw_id, FwState::Paused)?;
                self.transition(fw_id, FwState::Paused)
            }
            _ => self.transition(fw_id, FwState::Paused),
        }
    }

    /// PAUSED → WAITING/READY.
    pub(crate) fn resume(&mut self, fw_id: FwId) -> Result<bool, EngineError> {
        self.wake(fw_id, FwState::Paused)
    }

    /// DEFUSED → WAITING/READY.
    pub(crate) fn reignite(&mut self, fw_id: FwId) -> Result<bool, EngineError> {
        self.wake(fw_id, FwState::Defused)
    }

    fn wake(&mut self, fw_id: FwId, from: FwState) -> Result<bool, EngineError> {
        let state = self.state_of(fw_id)?;
        if state != from {
            return Err(EngineError::InvalidTransition {
                fw_id,
                from: state,
                to: FwState::Waiting,
            });
        }
        self.transition(fw_id, FwState::Waiting)?;
        self.refresh_readiness(fw_id)?;
        Ok(true)
    }

    pub(crate) fn archive(&mut self, fw_id: FwId) -> Result<bool, EngineError> {
        if self.state_of(fw_id)? == FwState::Reserved {
            self.cancel_reservation(fw_id, FwState::Archived)?;
        }
        self.settle(fw_id, FwState::Archived)
    }

    /// Defuse every member that has not finished. Returns how many changed.
    pub(crate) fn defuse_workflow(&mut self, wf_id: WfId) -> Result<usize, EngineError> {
        let nodes = self.workflow(wf_id)?.nodes.clone();
        let mut defused = 0;
        for fw_id in nodes {
            if matches!(
                self.state_of(fw_id)?,
                FwState::Completed | FwState::Defused | FwState::Archived
            ) {
                continue;
            }
            if self.defuse(fw_id)? {
                defused += 1;
            }
        }
        Ok(defused)
    }

    pub(crate) fn set_priority(&mut self, fw_id: FwId, priority: f64) -> Result<(), EngineError> {
        let now = self.now();
        let fw = self.firework_mut(fw_id)?;
        fw.spec.params.insert(PRIORITY_KEY.to_owned(), json!(priority));
        fw.updated_on = now;
        Ok(())
    }

    /// Move `fw_id` to an operator-chosen state. Only COMPLETED (or an
    /// allowed FIZZLED) parent satisfies a child, so children are re-checked
    /// whenever a parent leaves for a terminal side state.
    fn settle(&mut self, fw_id: FwId, next: FwState) -> Result<bool, EngineError> {
        let changed = self.transition(fw_id, next)?;
        if changed && next.is_terminal() {
            self.on_node_terminal(fw_id)?;
        }
        Ok(changed)
    }

    /// Fizzle the pending RESERVED launch so a later start is rejected.
    fn cancel_reservation(&mut self, fw_id: FwId, next: FwState) -> Result<(), EngineError> {
        let now = self.now();
        if let Some(launch) = self.firework_mut(fw_id)?.active_launch_mut() {
            let launch_id = launch.launch_id;
            launch.finish(
                FwState::Fizzled,
                FwAction::failure(format!("reservation cancelled: firework {next}")),
                now,
            );
            info!(fw_id, launch_id, to = %next, "cancelled pending reservation");
        }
        Ok(())
    }
}
