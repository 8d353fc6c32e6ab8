//! Workflow documents as submitted by users, plus build-time composition
//! helpers and powerups.
//!
//! Firework ids inside a `WorkflowSpec` are local (FireWorks uses negative
//! placeholders such as `-1`); submission maps them to fresh global ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasks::{Spec, TaskDescriptor};

use crate::error::StructuralError;
use crate::models::firework::{CATEGORY_KEY, FWORKER_KEY, PRIORITY_KEY};
use crate::models::{FwId, FwSpec};

// ---------------------------------------------------------------------------
// FireworkSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireworkSpec {
    pub fw_id: FwId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub spec: FwSpec,
}

impl FireworkSpec {
    pub fn new(fw_id: FwId, name: impl Into<String>) -> Self {
        Self {
            fw_id,
            name: name.into(),
            spec: FwSpec::default(),
        }
    }

    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.spec.tasks.push(task);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.spec.params.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "fws")]
    pub fireworks: Vec<FireworkSpec>,
    /// Parent → children, by local id.
    #[serde(default)]
    pub links: BTreeMap<FwId, Vec<FwId>>,
    #[serde(default)]
    pub metadata: Spec,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A one-node workflow named after the firework.
    pub fn from_firework(fw: FireworkSpec) -> Self {
        Self {
            name: fw.name.clone(),
            fireworks: vec![fw],
            ..Self::default()
        }
    }

    /// Decode a sub-workflow carried by an action (`additions`/`detours`).
    /// A bare firework document is accepted as a one-node workflow.
    pub fn from_value(value: &Value) -> Result<Self, StructuralError> {
        let invalid = |err: serde_json::Error| StructuralError::InvalidSubWorkflow(err.to_string());
        if value.get("fws").is_some() {
            serde_json::from_value(value.clone()).map_err(invalid)
        } else {
            serde_json::from_value(value.clone())
                .map(Self::from_firework)
                .map_err(invalid)
        }
    }

    pub fn with_firework(mut self, fw: FireworkSpec) -> Self {
        self.fireworks.push(fw);
        self
    }

    pub fn with_link(mut self, parent: FwId, child: FwId) -> Self {
        self.link(parent, child);
        self
    }

    pub fn link(&mut self, parent: FwId, child: FwId) {
        let children = self.links.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn firework_mut(&mut self, fw_id: FwId) -> Option<&mut FireworkSpec> {
        self.fireworks.iter_mut().find(|fw| fw.fw_id == fw_id)
    }

    /// Fireworks with no parents, in document order.
    pub fn root_ids(&self) -> Vec<FwId> {
        self.fireworks
            .iter()
            .map(|fw| fw.fw_id)
            .filter(|id| !self.links.values().any(|children| children.contains(id)))
            .collect()
    }

    /// Fireworks with no children, in document order.
    pub fn leaf_ids(&self) -> Vec<FwId> {
        self.fireworks
            .iter()
            .map(|fw| fw.fw_id)
            .filter(|id| self.links.get(id).map_or(true, Vec::is_empty))
            .collect()
    }

    /// Append `other` below `parent_ids` (or below this workflow's leaves
    /// when `parent_ids` is empty). `other`'s ids are shifted past this
    /// workflow's so the two never collide.
    pub fn append_wf(&mut self, other: WorkflowSpec, parent_ids: &[FwId]) -> Result<(), StructuralError> {
        for parent in parent_ids {
            if !self.fireworks.iter().any(|fw| fw.fw_id == *parent) {
                return Err(StructuralError::UnknownNodeReference {
                    node_id: *parent,
                    side: "parent",
                });
            }
        }
        let parents = if parent_ids.is_empty() {
            self.leaf_ids()
        } else {
            parent_ids.to_vec()
        };

        let next_free = self.fireworks.iter().map(|fw| fw.fw_id).max().map_or(0, |m| m + 1);
        let lowest = other.fireworks.iter().map(|fw| fw.fw_id).min().unwrap_or(0);
        let shift = next_free - lowest;

        let roots: Vec<FwId> = other.root_ids().into_iter().map(|id| id + shift).collect();
        for mut fw in other.fireworks {
            fw.fw_id += shift;
            self.fireworks.push(fw);
        }
        for (parent, children) in other.links {
            for child in children {
                self.link(parent + shift, child + shift);
            }
        }
        for parent in parents {
            for &root in &roots {
                self.link(parent, root);
            }
        }
        for (key, value) in other.metadata {
            self.metadata.entry(key).or_insert(value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Powerups
// ---------------------------------------------------------------------------

/// Rewrites applied to a workflow before submission.
pub mod powerups {
    use super::*;

    /// Tag the workflow metadata and every firework spec with `tags`.
    pub fn add_tags(wf: &mut WorkflowSpec, tags: &[&str]) {
        fn merge(slot: &mut Value, tags: &[&str]) {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(existing) = slot {
                for tag in tags {
                    let tag = Value::from(*tag);
                    if !existing.contains(&tag) {
                        existing.push(tag);
                    }
                }
            }
        }

        merge(wf.metadata.entry("tags").or_insert(Value::Null), tags);
        for fw in &mut wf.fireworks {
            merge(fw.spec.params.entry("tags").or_insert(Value::Null), tags);
        }
    }

    /// Merge `fields` into the `additional_fields` parameter of every task
    /// whose name contains `task_name_filter`. Returns how many tasks were
    /// touched.
    pub fn add_additional_fields_to_tasks(
        wf: &mut WorkflowSpec,
        task_name_filter: &str,
        fields: &Spec,
    ) -> usize {
        let mut touched = 0;
        for fw in &mut wf.fireworks {
            for task in &mut fw.spec.tasks {
                if !task.name.contains(task_name_filter) {
                    continue;
                }
                let slot = task
                    .params
                    .entry("additional_fields")
                    .or_insert_with(|| Value::Object(Spec::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Spec::new());
                }
                if let Value::Object(existing) = slot {
                    existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                touched += 1;
            }
        }
        touched
    }

    pub fn set_priority(wf: &mut WorkflowSpec, priority: f64) {
        set_param(wf, PRIORITY_KEY, Value::from(priority));
    }

    pub fn set_category(wf: &mut WorkflowSpec, category: &str) {
        set_param(wf, CATEGORY_KEY, Value::from(category));
    }

    pub fn pin_to_worker(wf: &mut WorkflowSpec, worker_name: &str) {
        set_param(wf, FWORKER_KEY, Value::from(worker_name));
    }

    pub fn add_metadata(wf: &mut WorkflowSpec, key: impl Into<String>, value: Value) {
        wf.metadata.insert(key.into(), value);
    }

    fn set_param(wf: &mut WorkflowSpec, key: &str, value: Value) {
        for fw in &mut wf.fireworks {
            fw.spec.params.insert(key.to_owned(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::powerups::*;
    use super::*;
    use serde_json::json;

    fn chain(name: &str, ids: &[FwId]) -> WorkflowSpec {
        let mut wf = WorkflowSpec::new(name);
        for &id in ids {
            wf.fireworks.push(FireworkSpec::new(id, format!("{name}-{id}")));
        }
        for pair in ids.windows(2) {
            wf.link(pair[0], pair[1]);
        }
        wf
    }

    #[test]
    fn roots_and_leaves() {
        let wf = chain("c", &[-1, -2, -3]);
        assert_eq!(wf.root_ids(), vec![-1]);
        assert_eq!(wf.leaf_ids(), vec![-3]);
    }

    #[test]
    fn append_wf_shifts_ids_and_hangs_off_leaves() {
        let mut wf = chain("static", &[0, 1]);
        wf.append_wf(chain("nscf", &[0, 1]), &[]).unwrap();

        let ids: Vec<FwId> = wf.fireworks.iter().map(|fw| fw.fw_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(wf.links[&1], vec![2]);
        assert_eq!(wf.links[&2], vec![3]);
        assert_eq!(wf.leaf_ids(), vec![3]);
    }

    #[test]
    fn append_wf_rejects_unknown_parent() {
        let mut wf = chain("a", &[1]);
        let err = wf.append_wf(chain("b", &[1]), &[42]).unwrap_err();
        assert!(matches!(err, StructuralError::UnknownNodeReference { node_id: 42, .. }));
    }

    #[test]
    fn bare_firework_decodes_as_single_node_workflow() {
        let wf = WorkflowSpec::from_value(&json!({
            "fw_id": -5,
            "name": "relax",
            "spec": { "_tasks": [ { "_fw_name": "ScriptTask", "script": "true" } ] }
        }))
        .unwrap();
        assert_eq!(wf.name, "relax");
        assert_eq!(wf.root_ids(), vec![-5]);

        assert!(matches!(
            WorkflowSpec::from_value(&json!({ "fws": "nope" })),
            Err(StructuralError::InvalidSubWorkflow(_))
        ));
    }

    #[test]
    fn powerups_rewrite_every_firework() {
        let mut wf = chain("p", &[1, 2]);
        wf.firework_mut(2)
            .unwrap()
            .spec
            .tasks
            .push(TaskDescriptor::new("{{atomate.vasp.firetasks.VaspToDb}}"));

        add_tags(&mut wf, &["magnetic", "bulk"]);
        add_tags(&mut wf, &["magnetic"]);
        set_priority(&mut wf, 5.0);
        pin_to_worker(&mut wf, "hpc-1");
        let fields = json!({ "task_label": "ordering" }).as_object().unwrap().clone();
        let touched = add_additional_fields_to_tasks(&mut wf, "ToDb", &fields);

        assert_eq!(touched, 1);
        assert_eq!(wf.metadata["tags"], json!(["magnetic", "bulk"]));
        for fw in &wf.fireworks {
            assert_eq!(fw.spec.priority(), Some(5.0));
            assert_eq!(fw.spec.pinned_worker(), Some("hpc-1"));
        }
        let task = &wf.fireworks[1].spec.tasks[0];
        assert_eq!(task.params["additional_fields"]["task_label"], json!("ordering"));
    }
}
