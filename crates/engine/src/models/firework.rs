//! `Firework` — a node of a workflow: ordered tasks plus a mutable spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasks::{Spec, TaskDescriptor};

use super::timestamp;
use super::{FwId, FwState, Launch, LaunchId, Tracker};

// ---------------------------------------------------------------------------
// Reserved spec keys
// ---------------------------------------------------------------------------

pub const TASKS_KEY: &str = "_tasks";
pub const CATEGORY_KEY: &str = "_category";
pub const PRIORITY_KEY: &str = "_priority";
pub const FWORKER_KEY: &str = "_fworker";
pub const ALLOW_FIZZLED_PARENTS_KEY: &str = "_allow_fizzled_parents";
pub const MAX_RERUNS_KEY: &str = "_max_reruns";
pub const TRACKERS_KEY: &str = "_trackers";

// ---------------------------------------------------------------------------
// FwSpec
// ---------------------------------------------------------------------------

/// A firework spec: `_tasks` plus free-form parameters the engine carries
/// but does not interpret (apart from the reserved keys above).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FwSpec {
    #[serde(rename = "_tasks", default)]
    pub tasks: Vec<TaskDescriptor>,
    #[serde(flatten)]
    pub params: Spec,
}

impl FwSpec {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self {
            tasks,
            params: Spec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn category(&self) -> Option<&str> {
        self.get(CATEGORY_KEY).and_then(Value::as_str)
    }

    pub fn priority(&self) -> Option<f64> {
        self.get(PRIORITY_KEY).and_then(Value::as_f64)
    }

    pub fn pinned_worker(&self) -> Option<&str> {
        self.get(FWORKER_KEY).and_then(Value::as_str)
    }

    pub fn allows_fizzled_parents(&self) -> bool {
        self.get(ALLOW_FIZZLED_PARENTS_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn max_reruns(&self) -> Option<u32> {
        self.get(MAX_RERUNS_KEY)
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Trackers requested by the spec; malformed entries are skipped.
    pub fn trackers(&self) -> Vec<Tracker> {
        self.get(TRACKERS_KEY)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Firework
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firework {
    pub spec: FwSpec,
    pub fw_id: FwId,
    #[serde(with = "timestamp")]
    pub created_on: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_on: DateTime<Utc>,
    /// Append-only; a rerun adds launches, it never removes them.
    #[serde(default)]
    pub launches: Vec<Launch>,
    pub state: FwState,
    pub name: String,
}

impl Firework {
    pub fn new(fw_id: FwId, name: impl Into<String>, spec: FwSpec, now: DateTime<Utc>) -> Self {
        Self {
            spec,
            fw_id,
            created_on: now,
            updated_on: now,
            launches: Vec::new(),
            state: FwState::Waiting,
            name: name.into(),
        }
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.spec.tasks
    }

    pub fn launch(&self, launch_id: LaunchId) -> Option<&Launch> {
        self.launches.iter().find(|l| l.launch_id == launch_id)
    }

    pub fn launch_mut(&mut self, launch_id: LaunchId) -> Option<&mut Launch> {
        self.launches.iter_mut().find(|l| l.launch_id == launch_id)
    }

    /// The launch currently holding the firework, if any.
    pub fn active_launch(&self) -> Option<&Launch> {
        self.launches.last().filter(|l| l.is_active())
    }

    pub fn active_launch_mut(&mut self) -> Option<&mut Launch> {
        self.launches.last_mut().filter(|l| l.is_active())
    }

    /// Whether `launch_id` is the launch that owns the firework right now:
    /// it is the active launch and the firework is still in the launch's
    /// state (a defuse or pause while RUNNING revokes ownership).
    pub fn is_owned_by(&self, launch_id: LaunchId) -> bool {
        matches!(self.active_launch(), Some(l) if l.launch_id == launch_id && l.state == self.state)
    }

    /// Launches that started running and then fizzled. Expired or
    /// cancelled reservations do not count.
    pub fn failed_runs(&self) -> usize {
        self.launches
            .iter()
            .filter(|l| l.state == FwState::Fizzled)
            .filter(|l| l.state_history.iter().any(|e| e.state == FwState::Running))
            .count()
    }
}
