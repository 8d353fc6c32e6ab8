//! The in-memory arena and transactional staging over it.
//!
//! A [`Txn`] reads through to the arena and copies any firework or workflow
//! it mutates. Nothing it does is visible until the engine has committed the
//! resulting [`Staged`] writes to the store and applied them to the arena;
//! dropping a `Txn` discards everything it staged.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use store::{ChangeSet, Counters, FireworkRow, Snapshot, WorkflowRow};
use tracing::debug;

use crate::config::EngineConfig;
use crate::models::{FWorker, Firework, FwId, FwState, Launch, LaunchId, WfId, Workflow};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Arena {
    pub(crate) workflows: BTreeMap<WfId, Workflow>,
    pub(crate) fireworks: BTreeMap<FwId, Firework>,
    fw_to_wf: HashMap<FwId, WfId>,
    launch_index: HashMap<LaunchId, FwId>,
    counters: Counters,
}

/// Higher priority first; fireworks without a priority after all others.
fn by_priority(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl Arena {
    /// Rebuild the arena from persisted documents.
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Result<Self, EngineError> {
        let mut arena = Arena {
            counters: snapshot.counters,
            ..Arena::default()
        };

        for row in snapshot.workflows {
            let wf: Workflow = serde_json::from_value(row.document)?;
            arena.workflows.insert(wf.wf_id, wf);
        }
        for row in snapshot.fireworks {
            let fw: Firework = serde_json::from_value(row.document)?;
            for launch in &fw.launches {
                arena.launch_index.insert(launch.launch_id, fw.fw_id);
            }
            arena.fw_to_wf.insert(fw.fw_id, row.wf_id);
            arena.fireworks.insert(fw.fw_id, fw);
        }

        // Never hand out an id that is already in use.
        let next = |current: i64, max_used: Option<i64>| current.max(max_used.map_or(1, |m| m + 1));
        arena.counters.next_fw_id = next(arena.counters.next_fw_id, arena.fireworks.keys().max().copied());
        arena.counters.next_wf_id = next(arena.counters.next_wf_id, arena.workflows.keys().max().copied());
        arena.counters.next_launch_id =
            next(arena.counters.next_launch_id, arena.launch_index.keys().max().copied());

        Ok(arena)
    }

    pub(crate) fn workflow_of(&self, fw_id: FwId) -> Option<WfId> {
        self.fw_to_wf.get(&fw_id).copied()
    }

    pub(crate) fn launch(&self, launch_id: LaunchId) -> Option<(&Firework, &Launch)> {
        let fw = self.fireworks.get(self.launch_index.get(&launch_id)?)?;
        Some((fw, fw.launch(launch_id)?))
    }

    /// READY fireworks `worker` accepts, in claim order: priority, then id.
    pub(crate) fn ready_candidates(&self, worker: &FWorker) -> Vec<FwId> {
        let mut ready: Vec<&Firework> = self
            .fireworks
            .values()
            .filter(|fw| fw.state == FwState::Ready && worker.matches(fw))
            .collect();
        ready.sort_by(|a, b| {
            by_priority(a.spec.priority(), b.spec.priority()).then(a.fw_id.cmp(&b.fw_id))
        });
        ready.into_iter().map(|fw| fw.fw_id).collect()
    }

    /// Launches still in `state` whose trailing history entry is older than
    /// `cutoff`, whatever their firework has moved on to since.
    pub(crate) fn stale_launches(&self, state: FwState, cutoff: DateTime<Utc>) -> Vec<LaunchId> {
        self.fireworks
            .values()
            .flat_map(|fw| fw.launches.iter())
            .filter(|l| l.state == state && l.last_update().is_some_and(|t| t < cutoff))
            .map(|l| l.launch_id)
            .collect()
    }

    pub(crate) fn apply(&mut self, staged: Staged) {
        self.workflows.extend(staged.workflows);
        self.fireworks.extend(staged.fireworks);
        self.fw_to_wf.extend(staged.fw_wf);
        self.launch_index.extend(staged.launch_index);
        if let Some(counters) = staged.counters {
            self.counters = counters;
        }
    }
}

// ---------------------------------------------------------------------------
// Staged writes
// ---------------------------------------------------------------------------

/// Everything a finished transaction wants to write.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    fireworks: BTreeMap<FwId, Firework>,
    workflows: BTreeMap<WfId, Workflow>,
    fw_wf: HashMap<FwId, WfId>,
    launch_index: HashMap<LaunchId, FwId>,
    counters: Option<Counters>,
}

impl Staged {
    pub(crate) fn is_empty(&self) -> bool {
        self.fireworks.is_empty() && self.workflows.is_empty() && self.counters.is_none()
    }

    pub(crate) fn to_changeset(&self) -> Result<ChangeSet, EngineError> {
        let workflows = self
            .workflows
            .values()
            .map(|wf| {
                Ok(WorkflowRow {
                    wf_id: wf.wf_id,
                    name: wf.name.clone(),
                    state: wf.state.to_string(),
                    document: serde_json::to_value(wf)?,
                    created_on: wf.created_on,
                    updated_on: wf.updated_on,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let fireworks = self
            .fireworks
            .values()
            .map(|fw| {
                let wf_id = self
                    .fw_wf
                    .get(&fw.fw_id)
                    .copied()
                    .ok_or(EngineError::FireworkNotFound(fw.fw_id))?;
                Ok(FireworkRow {
                    fw_id: fw.fw_id,
                    wf_id,
                    name: fw.name.clone(),
                    state: fw.state.to_string(),
                    document: serde_json::to_value(fw)?,
                    updated_on: fw.updated_on,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(ChangeSet {
            workflows,
            fireworks,
            counters: self.counters,
        })
    }
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

pub(crate) struct Txn<'a> {
    base: &'a Arena,
    config: &'a EngineConfig,
    now: DateTime<Utc>,
    fireworks: BTreeMap<FwId, Firework>,
    workflows: BTreeMap<WfId, Workflow>,
    fw_to_wf: HashMap<FwId, WfId>,
    launch_index: HashMap<LaunchId, FwId>,
    counters: Counters,
    counters_dirty: bool,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(base: &'a Arena, config: &'a EngineConfig, now: DateTime<Utc>) -> Self {
        Self {
            base,
            config,
            now,
            fireworks: BTreeMap::new(),
            workflows: BTreeMap::new(),
            fw_to_wf: HashMap::new(),
            launch_index: HashMap::new(),
            counters: base.counters,
            counters_dirty: false,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn config(&self) -> &'a EngineConfig {
        self.config
    }

    // -----------------------------------------------------------------------
    // Reads (staged copy first, then the arena)
    // -----------------------------------------------------------------------

    pub(crate) fn firework(&self, fw_id: FwId) -> Result<&Firework, EngineError> {
        self.fireworks
            .get(&fw_id)
            .or_else(|| self.base.fireworks.get(&fw_id))
            .ok_or(EngineError::FireworkNotFound(fw_id))
    }

    pub(crate) fn state_of(&self, fw_id: FwId) -> Result<FwState, EngineError> {
        Ok(self.firework(fw_id)?.state)
    }

    pub(crate) fn workflow(&self, wf_id: WfId) -> Result<&Workflow, EngineError> {
        self.workflows
            .get(&wf_id)
            .or_else(|| self.base.workflows.get(&wf_id))
            .ok_or(EngineError::WorkflowNotFound(wf_id))
    }

    pub(crate) fn wf_id_of(&self, fw_id: FwId) -> Result<WfId, EngineError> {
        self.fw_to_wf
            .get(&fw_id)
            .or_else(|| self.base.fw_to_wf.get(&fw_id))
            .copied()
            .ok_or(EngineError::FireworkNotFound(fw_id))
    }

    /// The workflow `fw_id` belongs to.
    pub(crate) fn workflow_for(&self, fw_id: FwId) -> Result<&Workflow, EngineError> {
        self.workflow(self.wf_id_of(fw_id)?)
    }

    pub(crate) fn fw_id_of_launch(&self, launch_id: LaunchId) -> Result<FwId, EngineError> {
        self.launch_index
            .get(&launch_id)
            .or_else(|| self.base.launch_index.get(&launch_id))
            .copied()
            .ok_or(EngineError::LaunchNotFound(launch_id))
    }

    /// The launch and the firework it belongs to.
    pub(crate) fn launch(&self, launch_id: LaunchId) -> Result<(&Firework, &Launch), EngineError> {
        let fw = self.firework(self.fw_id_of_launch(launch_id)?)?;
        let launch = fw
            .launch(launch_id)
            .ok_or(EngineError::LaunchNotFound(launch_id))?;
        Ok((fw, launch))
    }

    // -----------------------------------------------------------------------
    // Writes (copy into the staging area on first touch)
    // -----------------------------------------------------------------------

    pub(crate) fn firework_mut(&mut self, fw_id: FwId) -> Result<&mut Firework, EngineError> {
        if !self.fireworks.contains_key(&fw_id) {
            let fw = self
                .base
                .fireworks
                .get(&fw_id)
                .cloned()
                .ok_or(EngineError::FireworkNotFound(fw_id))?;
            self.fireworks.insert(fw_id, fw);
        }
        self.fireworks
            .get_mut(&fw_id)
            .ok_or(EngineError::FireworkNotFound(fw_id))
    }

    pub(crate) fn workflow_mut(&mut self, wf_id: WfId) -> Result<&mut Workflow, EngineError> {
        if !self.workflows.contains_key(&wf_id) {
            let wf = self
                .base
                .workflows
                .get(&wf_id)
                .cloned()
                .ok_or(EngineError::WorkflowNotFound(wf_id))?;
            self.workflows.insert(wf_id, wf);
        }
        self.workflows
            .get_mut(&wf_id)
            .ok_or(EngineError::WorkflowNotFound(wf_id))
    }

    pub(crate) fn launch_mut(&mut self, launch_id: LaunchId) -> Result<&mut Launch, EngineError> {
        let fw_id = self.fw_id_of_launch(launch_id)?;
        self.firework_mut(fw_id)?
            .launch_mut(launch_id)
            .ok_or(EngineError::LaunchNotFound(launch_id))
    }

    pub(crate) fn insert_workflow(&mut self, wf: Workflow) {
        self.workflows.insert(wf.wf_id, wf);
    }

    pub(crate) fn insert_firework(&mut self, wf_id: WfId, fw: Firework) {
        self.fw_to_wf.insert(fw.fw_id, wf_id);
        self.fireworks.insert(fw.fw_id, fw);
    }

    pub(crate) fn add_launch(&mut self, launch: Launch) -> Result<(), EngineError> {
        let (fw_id, launch_id) = (launch.fw_id, launch.launch_id);
        self.firework_mut(fw_id)?.launches.push(launch);
        self.launch_index.insert(launch_id, fw_id);
        Ok(())
    }

    pub(crate) fn alloc_fw_id(&mut self) -> FwId {
        self.counters_dirty = true;
        let id = self.counters.next_fw_id;
        self.counters.next_fw_id += 1;
        id
    }

    pub(crate) fn alloc_launch_id(&mut self) -> LaunchId {
        self.counters_dirty = true;
        let id = self.counters.next_launch_id;
        self.counters.next_launch_id += 1;
        id
    }

    pub(crate) fn alloc_wf_id(&mut self) -> WfId {
        self.counters_dirty = true;
        let id = self.counters.next_wf_id;
        self.counters.next_wf_id += 1;
        id
    }

    /// Move a firework to `next` if the state machine allows it.
    ///
    /// Returns `Ok(false)` when the firework is already in `next`.
    pub(crate) fn transition(&mut self, fw_id: FwId, next: FwState) -> Result<bool, EngineError> {
        let current = self.state_of(fw_id)?;
        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                fw_id,
                from: current,
                to: next,
            });
        }
        let now = self.now;
        let fw = self.firework_mut(fw_id)?;
        fw.state = next;
        fw.updated_on = now;
        debug!(fw_id, from = %current, to = %next, "firework transition");
        Ok(true)
    }

    /// Close the transaction: refresh the cached member states of every
    /// workflow it touched and hand back the writes.
    pub(crate) fn finish(mut self) -> Result<Staged, EngineError> {
        let now = self.now;
        let touched: Vec<(FwId, FwState)> =
            self.fireworks.values().map(|fw| (fw.fw_id, fw.state)).collect();

        let mut fw_wf = HashMap::with_capacity(touched.len());
        for (fw_id, state) in touched {
            let wf_id = self.wf_id_of(fw_id)?;
            fw_wf.insert(fw_id, wf_id);
            let wf = self.workflow_mut(wf_id)?;
            if wf.fw_states.get(&fw_id) != Some(&state) {
                wf.record_state(fw_id, state, now);
            }
        }
        for wf in self.workflows.values_mut() {
            wf.state = wf.derived_state();
        }

        Ok(Staged {
            fireworks: self.fireworks,
            workflows: self.workflows,
            fw_wf,
            launch_index: self.launch_index,
            counters: self.counters_dirty.then_some(self.counters),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{timestamp, FwSpec};
    use serde_json::json;

    fn arena_with(fws: &[(FwId, Option<f64>)]) -> Arena {
        let now = timestamp::now();
        let mut arena = Arena::default();
        let mut wf = Workflow::new(1, "wf", now);
        for &(fw_id, priority) in fws {
            let mut spec = FwSpec::default();
            if let Some(p) = priority {
                spec.params.insert("_priority".into(), json!(p));
            }
            let mut fw = Firework::new(fw_id, format!("fw{fw_id}"), spec, now);
            fw.state = FwState::Ready;
            wf.add_node(fw_id, FwState::Ready);
            arena.fw_to_wf.insert(fw_id, 1);
            arena.fireworks.insert(fw_id, fw);
        }
        arena.workflows.insert(1, wf);
        arena
    }

    #[test]
    fn candidates_ordered_by_priority_then_id() {
        let arena = arena_with(&[(1, None), (2, Some(1.0)), (3, Some(5.0)), (4, None), (5, Some(1.0))]);
        assert_eq!(arena.ready_candidates(&FWorker::default()), vec![3, 2, 5, 1, 4]);
    }

    #[test]
    fn dropped_txn_leaves_arena_untouched() {
        let arena = arena_with(&[(1, None)]);
        let config = EngineConfig::default();
        {
            let mut txn = Txn::new(&arena, &config, timestamp::now());
            txn.transition(1, FwState::Paused).unwrap();
            assert_eq!(txn.state_of(1).unwrap(), FwState::Paused);
        }
        assert_eq!(arena.fireworks[&1].state, FwState::Ready);
    }

    #[test]
    fn finish_refreshes_workflow_cache_and_counters() {
        let arena = arena_with(&[(1, None), (2, None)]);
        let config = EngineConfig::default();
        let mut txn = Txn::new(&arena, &config, timestamp::now());
        txn.transition(1, FwState::Defused).unwrap();
        assert_eq!(txn.alloc_launch_id(), 1);

        let staged = txn.finish().unwrap();
        let changes = staged.to_changeset().unwrap();
        assert_eq!(changes.fireworks.len(), 1);
        assert_eq!(changes.fireworks[0].state, "DEFUSED");
        assert_eq!(changes.workflows[0].state, "DEFUSED");
        assert_eq!(changes.counters.unwrap().next_launch_id, 2);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let arena = arena_with(&[(1, None)]);
        let config = EngineConfig::default();
        let mut txn = Txn::new(&arena, &config, timestamp::now());
        let err = txn.transition(1, FwState::Completed).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { fw_id: 1, from: FwState::Ready, to: FwState::Completed }
        ));
    }
}
