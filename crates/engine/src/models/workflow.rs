//! `Workflow` — a DAG of fireworks connected by parent → child links.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasks::Spec;

use super::timestamp;
use super::{FwId, FwState, WfId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub wf_id: WfId,
    pub name: String,
    /// Member fireworks in insertion (topological at submission) order.
    pub nodes: Vec<FwId>,
    /// Parent → children. Every node has an entry, possibly empty.
    pub links: BTreeMap<FwId, Vec<FwId>>,
    #[serde(default)]
    pub metadata: Spec,
    /// Cached member states, refreshed on every commit that touches a member.
    #[serde(default)]
    pub fw_states: BTreeMap<FwId, FwState>,
    /// Summary derived from `fw_states`; a view, never a source of truth.
    pub state: FwState,
    #[serde(with = "timestamp")]
    pub created_on: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_on: DateTime<Utc>,
}

impl Workflow {
    pub fn new(wf_id: WfId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            wf_id,
            name: name.into(),
            nodes: Vec::new(),
            links: BTreeMap::new(),
            metadata: Spec::new(),
            fw_states: BTreeMap::new(),
            state: FwState::Waiting,
            created_on: now,
            updated_on: now,
        }
    }

    // -----------------------------------------------------------------------
    // Graph queries
    // -----------------------------------------------------------------------

    pub fn contains(&self, fw_id: FwId) -> bool {
        self.links.contains_key(&fw_id)
    }

    pub fn children(&self, fw_id: FwId) -> &[FwId] {
        self.links.get(&fw_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parents(&self, fw_id: FwId) -> Vec<FwId> {
        self.links
            .iter()
            .filter(|(_, children)| children.contains(&fw_id))
            .map(|(&parent, _)| parent)
            .collect()
    }

    pub fn roots(&self) -> Vec<FwId> {
        let with_parents: BTreeSet<FwId> = self.links.values().flatten().copied().collect();
        self.nodes
            .iter()
            .copied()
            .filter(|id| !with_parents.contains(id))
            .collect()
    }

    pub fn leaves(&self) -> Vec<FwId> {
        self.nodes
            .iter()
            .copied()
            .filter(|&id| self.children(id).is_empty())
            .collect()
    }

    /// Every node reachable from `fw_id`, excluding `fw_id` itself.
    pub fn descendants(&self, fw_id: FwId) -> BTreeSet<FwId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<FwId> = self.children(fw_id).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.children(next).iter().copied());
            }
        }
        seen
    }

    pub fn reaches(&self, from: FwId, to: FwId) -> bool {
        from == to || self.descendants(from).contains(&to)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    pub fn add_node(&mut self, fw_id: FwId, state: FwState) {
        if !self.contains(fw_id) {
            self.nodes.push(fw_id);
            self.links.insert(fw_id, Vec::new());
        }
        self.fw_states.insert(fw_id, state);
    }

    pub fn add_link(&mut self, parent: FwId, child: FwId) {
        let children = self.links.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn remove_link(&mut self, parent: FwId, child: FwId) -> bool {
        match self.links.get_mut(&parent) {
            Some(children) => {
                let before = children.len();
                children.retain(|&c| c != child);
                before != children.len()
            }
            None => false,
        }
    }

    /// Record a member's new state and re-derive the summary.
    pub fn record_state(&mut self, fw_id: FwId, state: FwState, now: DateTime<Utc>) {
        self.fw_states.insert(fw_id, state);
        self.state = self.derived_state();
        self.updated_on = now;
    }

    /// Summary state: ARCHIVED if every node is, COMPLETED if every live
    /// node is, then DEFUSED, PAUSED or FIZZLED if any node is, then RUNNING
    /// once anything has started, else the most advanced pending state.
    pub fn derived_state(&self) -> FwState {
        let states: Vec<FwState> = self.fw_states.values().copied().collect();
        if states.is_empty() {
            return FwState::Waiting;
        }
        if states.iter().all(|&s| s == FwState::Archived) {
            return FwState::Archived;
        }
        let live: Vec<FwState> = states.into_iter().filter(|&s| s != FwState::Archived).collect();
        let any = |wanted: FwState| live.contains(&wanted);

        if live.iter().all(|&s| s == FwState::Completed) {
            FwState::Completed
        } else if any(FwState::Defused) {
            FwState::Defused
        } else if any(FwState::Paused) {
            FwState::Paused
        } else if any(FwState::Fizzled) {
            FwState::Fizzled
        } else if any(FwState::Running) || any(FwState::Completed) {
            FwState::Running
        } else if any(FwState::Reserved) {
            FwState::Reserved
        } else if any(FwState::Ready) {
            FwState::Ready
        } else {
            FwState::Waiting
        }
    }
}
