//! `FWorker` — description of an executor asking for work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasks::Spec;

use super::Firework;
use crate::query::Query;

/// Worker category that accepts only uncategorised fireworks.
pub const NO_CATEGORY: &str = "__none__";

fn default_name() -> String {
    "Automatically generated Worker".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FWorker {
    #[serde(default = "default_name")]
    pub name: String,
    /// Empty accepts any category.
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub query: Query,
    /// Handed to tasks at run time; never copied into firework specs.
    #[serde(default)]
    pub env: Spec,
}

impl Default for FWorker {
    fn default() -> Self {
        Self {
            name: default_name(),
            category: String::new(),
            query: Query::any(),
            env: Spec::new(),
        }
    }
}

impl FWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: Value) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    fn accepts_category(&self, category: Option<&str>) -> bool {
        match self.category.as_str() {
            "" => true,
            NO_CATEGORY => category.is_none(),
            wanted => category == Some(wanted),
        }
    }

    /// Category, worker pin and query all accept the firework.
    pub fn matches(&self, fw: &Firework) -> bool {
        if !self.accepts_category(fw.spec.category()) {
            return false;
        }
        if let Some(pinned) = fw.spec.pinned_worker() {
            if pinned != self.name {
                return false;
            }
        }
        self.query.matches(&fw.spec.params)
    }
}
