//! The `FireTask` trait — the contract every task must fulfil.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::{FwAction, Spec, TaskError};

/// Context passed to every task of a launch.
///
/// Defined here (in the tasks crate) so both the engine and individual task
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// Firework being executed.
    pub fw_id: i64,
    /// Launch (execution attempt) this task belongs to.
    pub launch_id: i64,
    /// Working directory of the launch.
    pub launch_dir: PathBuf,
    /// Worker environment (executables, credential files, scratch dirs).
    /// Handed through untouched; the engine never reads it.
    pub env: Spec,
}

/// What a task hands back to the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Fragment deep-merged into the launch's private spec copy before the
    /// next task runs.
    pub update: Spec,
    /// Only authoritative when produced by the last task (or with `exit`).
    pub action: Option<FwAction>,
}

impl TaskOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_update(update: Spec) -> Self {
        Self {
            update,
            action: None,
        }
    }

    pub fn with_action(mut self, action: FwAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// The core task trait.
///
/// Implementations must be safe to re-invoke: the engine calls them again on
/// reruns and on retryable errors.
#[async_trait]
pub trait FireTask: Send + Sync {
    /// Run the task with its own descriptor `params`, the launch's current
    /// `spec` (including updates from earlier tasks) and the launch context.
    async fn run(
        &self,
        params: &Spec,
        spec: &Spec,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError>;
}
