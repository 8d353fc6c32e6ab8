//! Name → implementation lookup for task plugins.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::builtin::{FileWriteTask, ModSpecTask, ScriptTask};
use crate::descriptor::{normalize_name, short_name};
use crate::FireTask;

/// Maps task names to shared `FireTask` implementations.
///
/// Lookups accept FireWorks-style names: `{{pkg.module.Class}}` resolves to a
/// registration under `pkg.module.Class` first, then under `Class`.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn FireTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in tasks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ScriptTask", Arc::new(ScriptTask));
        registry.register("FileWriteTask", Arc::new(FileWriteTask));
        registry.register("ModSpecTask", Arc::new(ModSpecTask));
        registry
    }

    /// Register `task` under `name`, returning any implementation it replaced.
    pub fn register(
        &mut self,
        name: impl AsRef<str>,
        task: Arc<dyn FireTask>,
    ) -> Option<Arc<dyn FireTask>> {
        self.tasks
            .insert(normalize_name(name.as_ref()).to_owned(), task)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FireTask>> {
        self.tasks
            .get(normalize_name(name))
            .or_else(|| self.tasks.get(short_name(name)))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
