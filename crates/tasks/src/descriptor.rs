//! Task descriptors as they appear in a firework's `spec._tasks` list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema-less key/value document used for firework specs, task parameters
/// and worker environments. Only the task that consumes a field validates it.
pub type Spec = Map<String, Value>;

/// One entry of `spec._tasks`: the plugin name plus its parameters.
///
/// Serialised flat, the way FireWorks stores tasks:
/// `{"_fw_name": "{{pkg.module.WriteInput}}", "molecule": {...}, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(rename = "_fw_name")]
    pub name: String,
    #[serde(flatten)]
    pub params: Spec,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Spec::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// The name with FireWorks' `{{ }}` wrapper stripped.
    pub fn normalized_name(&self) -> &str {
        normalize_name(&self.name)
    }
}

/// Strip the `{{ ... }}` wrapper FireWorks puts around fully-qualified names.
pub fn normalize_name(name: &str) -> &str {
    name.trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim()
}

/// Last dotted segment of a normalised name (`pkg.module.Class` → `Class`).
pub fn short_name(name: &str) -> &str {
    let normalized = normalize_name(name);
    normalized.rsplit('.').next().unwrap_or(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_round_trips_flat_fireworks_shape() {
        let raw = json!({
            "_fw_name": "{{atomate.qchem.firetasks.run_calc.RunQChemCustodian}}",
            "qchem_cmd": ">>qchem_cmd<<",
            "max_cores": 32
        });

        let desc: TaskDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(desc.normalized_name(), "atomate.qchem.firetasks.run_calc.RunQChemCustodian");
        assert_eq!(desc.params["max_cores"], 32);
        assert!(!desc.params.contains_key("_fw_name"));

        assert_eq!(serde_json::to_value(&desc).unwrap(), raw);
    }

    #[test]
    fn short_name_takes_last_segment() {
        assert_eq!(short_name("{{fireworks.user_objects.firetasks.script_task.ScriptTask}}"), "ScriptTask");
        assert_eq!(short_name("ScriptTask"), "ScriptTask");
    }
}
