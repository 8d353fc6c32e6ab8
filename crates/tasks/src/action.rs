//! `FwAction` — the structured result of a firework's terminal task.
//!
//! The engine folds the action into node and workflow state: it decides the
//! launch outcome, which downstream nodes receive spec updates, and whether
//! new nodes are spliced into the running workflow.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Spec;

/// Key under `stored_data` holding failure details.
pub const EXCEPTION_KEY: &str = "_exception";

/// Whether the launch that produced the action succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Success,
    Failure,
}

/// Action directive returned by a task.
///
/// Missing fields deserialize to their defaults, so plain FireWorks action
/// documents (which carry no `outcome`) load as successes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FwAction {
    pub outcome: Outcome,
    /// Data kept on the launch for audit.
    pub stored_data: Spec,
    /// Stop the pipeline after this task; the action becomes authoritative.
    pub exit: bool,
    /// Merged into designated downstream specs at commit time.
    pub update_spec: Spec,
    /// DictMod-style modifications (`{"_push": {"key": value}}`, ...)
    /// applied to designated downstream specs at commit time.
    pub mod_spec: Vec<Value>,
    /// Sub-workflows appended as children of the current firework.
    pub additions: Vec<Value>,
    /// Sub-workflows inserted between the current firework and its children.
    pub detours: Vec<Value>,
    pub defuse_children: bool,
    pub defuse_workflow: bool,
    /// Apply spec updates to all descendants instead of direct children.
    pub propagate: bool,
    /// Explicit downstream targets for spec updates; overrides `propagate`.
    pub update_targets: Vec<i64>,
}

impl FwAction {
    pub fn success() -> Self {
        Self::default()
    }

    /// A failure action carrying `detail` under `stored_data._exception`.
    pub fn failure(detail: impl Into<String>) -> Self {
        let mut stored_data = Spec::new();
        stored_data.insert(EXCEPTION_KEY.into(), json!({ "_details": detail.into() }));
        Self {
            outcome: Outcome::Failure,
            stored_data,
            ..Self::default()
        }
    }

    /// A failure action attributed to the task at `index` in the task list.
    pub fn task_failure(detail: impl Into<String>, task_name: &str, index: usize) -> Self {
        let mut stored_data = Spec::new();
        stored_data.insert(
            EXCEPTION_KEY.into(),
            json!({
                "_details": detail.into(),
                "_task": task_name,
                "_task_index": index,
            }),
        );
        Self {
            outcome: Outcome::Failure,
            stored_data,
            ..Self::default()
        }
    }

    pub fn with_stored_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.stored_data.insert(key.into(), value);
        self
    }

    pub fn with_update_spec(mut self, update: Spec) -> Self {
        self.update_spec = update;
        self
    }

    pub fn with_mod_spec(mut self, modification: Value) -> Self {
        self.mod_spec.push(modification);
        self
    }

    pub fn with_addition(mut self, workflow: Value) -> Self {
        self.additions.push(workflow);
        self
    }

    pub fn with_detour(mut self, workflow: Value) -> Self {
        self.detours.push(workflow);
        self
    }

    pub fn targeting(mut self, fw_ids: impl IntoIterator<Item = i64>) -> Self {
        self.update_targets = fw_ids.into_iter().collect();
        self
    }

    pub fn propagating(mut self) -> Self {
        self.propagate = true;
        self
    }

    pub fn exiting(mut self) -> Self {
        self.exit = true;
        self
    }

    pub fn defusing_children(mut self) -> Self {
        self.defuse_children = true;
        self
    }

    pub fn defusing_workflow(mut self) -> Self {
        self.defuse_workflow = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Failure detail recorded under `stored_data._exception._details`.
    pub fn error_detail(&self) -> Option<&str> {
        self.stored_data
            .get(EXCEPTION_KEY)
            .and_then(|exc| exc.get("_details"))
            .and_then(Value::as_str)
    }

    /// True when the action carries spec updates for downstream nodes.
    pub fn updates_downstream(&self) -> bool {
        !self.update_spec.is_empty() || !self.mod_spec.is_empty()
    }

    /// True when the action rewrites the workflow graph.
    pub fn mutates_workflow(&self) -> bool {
        !self.additions.is_empty() || !self.detours.is_empty()
    }
}
