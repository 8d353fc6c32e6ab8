//! Task pipeline — runs one launch's task list.
//!
//! `TaskPipeline` is the per-launch orchestrator:
//! 1. Runs the firework's tasks strictly in order on a private spec copy.
//! 2. Deep-merges each task's output fragment into that copy for the next task.
//! 3. Retries `TaskError::Retryable` up to `task_retries` with exponential
//!    back-off; `TaskError::Fatal`, panics and unknown task names stop the
//!    pipeline immediately with a FIZZLED action.
//! 4. Asks a [`CancellationProbe`] before every task and stops when the
//!    launch no longer owns its firework.
//!
//! Only the last executed task's action is authoritative. An earlier task
//! may end the pipeline by returning an action with `exit` set or a failure
//! outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tasks::{FireTask, FwAction, Spec, TaskContext, TaskDescriptor, TaskError, TaskOutput, TaskRegistry};
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::dict_mod::deep_merge;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Asked before each task whether the launch may go on.
#[async_trait]
pub trait CancellationProbe: Send + Sync {
    async fn should_continue(&self) -> bool;
}

/// A probe that never cancels.
pub struct NeverCancel;

#[async_trait]
impl CancellationProbe for NeverCancel {
    async fn should_continue(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// The action to report for the launch.
    pub action: FwAction,
    /// Final state of the private spec copy. Discarded by the engine.
    pub spec: Spec,
    /// Tasks invoked (including the failing one).
    pub executed: usize,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// TaskPipeline
// ---------------------------------------------------------------------------

pub struct TaskPipeline<'a> {
    registry: &'a TaskRegistry,
    config: &'a PipelineConfig,
}

impl<'a> TaskPipeline<'a> {
    pub fn new(registry: &'a TaskRegistry, config: &'a PipelineConfig) -> Self {
        Self { registry, config }
    }

    /// Run `tasks` in order against a copy of `spec`.
    #[instrument(skip_all, fields(fw_id = ctx.fw_id, launch_id = ctx.launch_id, tasks = tasks.len()))]
    pub async fn run(
        &self,
        tasks: &[TaskDescriptor],
        spec: &Spec,
        ctx: &TaskContext,
        probe: &dyn CancellationProbe,
    ) -> PipelineOutcome {
        let mut working = spec.clone();
        let mut executed = 0;
        let last = tasks.len().saturating_sub(1);

        for (index, descriptor) in tasks.iter().enumerate() {
            if !probe.should_continue().await {
                warn!(index, task = %descriptor.name, "launch cancelled; stopping before task");
                let action = FwAction::task_failure("launch cancelled", &descriptor.name, index)
                    .with_stored_data("_cancelled", json!(true));
                return PipelineOutcome {
                    action,
                    spec: working,
                    executed,
                    cancelled: true,
                };
            }

            executed += 1;
            let result = match self.registry.get(&descriptor.name) {
                Some(task) => {
                    self.execute_with_retry(index, descriptor, task.as_ref(), &working, ctx)
                        .await
                }
                None => Err(TaskError::fatal(format!(
                    "no task registered under '{}'",
                    descriptor.name
                ))),
            };

            match result {
                Ok(output) => {
                    deep_merge(&mut working, &output.update);
                    debug!(index, task = %descriptor.name, "task succeeded");

                    match output.action {
                        Some(action) if index == last => {
                            return Self::finished(action, working, executed);
                        }
                        Some(action) if action.exit || !action.is_success() => {
                            info!(index, task = %descriptor.name, "task ended the pipeline early");
                            return Self::finished(action, working, executed);
                        }
                        Some(action) => {
                            debug!(index, task = %descriptor.name, ?action, "ignoring advisory action");
                        }
                        None => {}
                    }
                }
                Err(err) => {
                    error!(index, task = %descriptor.name, error = %err, "task failed; stopping pipeline");
                    let action = FwAction::task_failure(err.message(), &descriptor.name, index);
                    return Self::finished(action, working, executed);
                }
            }
        }

        Self::finished(FwAction::success(), working, executed)
    }

    fn finished(action: FwAction, spec: Spec, executed: usize) -> PipelineOutcome {
        PipelineOutcome {
            action,
            spec,
            executed,
            cancelled: false,
        }
    }

    // -----------------------------------------------------------------------
    // Internal: run a single task with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        index: usize,
        descriptor: &TaskDescriptor,
        task: &dyn FireTask,
        spec: &Spec,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        let mut attempts = 0u32;

        loop {
            let run = AssertUnwindSafe(task.run(&descriptor.params, spec, ctx)).catch_unwind();
            match run.await {
                Ok(Ok(output)) => return Ok(output),

                Ok(Err(TaskError::Retryable(msg))) => {
                    attempts += 1;
                    if attempts > self.config.task_retries {
                        return Err(TaskError::Retryable(format!(
                            "gave up after {attempts} attempts: {msg}"
                        )));
                    }

                    let delay = backoff(self.config.retry_base_delay, attempts);

                    warn!(
                        "task {} '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        index, descriptor.name, attempts, self.config.task_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }

                Ok(Err(fatal)) => return Err(fatal),

                Err(panic) => {
                    let msg = panic_message(&*panic);
                    return Err(TaskError::fatal(format!("task panicked: {msg}")));
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Longest pause between two attempts of a retryable task.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// Exponential backoff for the `attempt`-th retry, capped at
/// [`MAX_RETRY_DELAY`].
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(MAX_RETRY_DELAY).min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tasks::mock::MockTask;

    fn registry(tasks: Vec<(&str, Arc<MockTask>)>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        for (name, task) in tasks {
            registry.register(name, task);
        }
        registry
    }

    fn descriptors(names: &[&str]) -> Vec<TaskDescriptor> {
        names.iter().map(|n| TaskDescriptor::new(*n)).collect()
    }

    fn spec(value: serde_json::Value) -> Spec {
        value.as_object().unwrap().clone()
    }

    /// Allows the first `n` checks, then cancels.
    struct CancelAfter(usize, AtomicUsize);

    #[async_trait]
    impl CancellationProbe for CancelAfter {
        async fn should_continue(&self) -> bool {
            self.1.fetch_add(1, Ordering::SeqCst) < self.0
        }
    }

    #[tokio::test]
    async fn fragments_flow_into_later_tasks_without_touching_input() {
        let a = Arc::new(MockTask::returning("a", json!({ "energy": -1.5 })));
        let b = Arc::new(MockTask::returning("b", json!({})));
        let reg = registry(vec![("A", a.clone()), ("B", b.clone())]);
        let config = PipelineConfig::default();
        let input = spec(json!({ "structure": "NiO" }));

        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["A", "B"]), &input, &TaskContext::default(), &NeverCancel)
            .await;

        assert!(outcome.action.is_success());
        assert_eq!(outcome.executed, 2);
        let seen_by_b = b.last_spec().unwrap();
        assert_eq!(seen_by_b["energy"], json!(-1.5));
        assert_eq!(seen_by_b["last_task"], json!("a"));
        assert_eq!(input, spec(json!({ "structure": "NiO" })));
    }

    #[tokio::test]
    async fn failure_short_circuits_remaining_tasks() {
        let ok = Arc::new(MockTask::returning("ok", json!({})));
        let bad = Arc::new(MockTask::failing_fatal("bad", "INCAR missing"));
        let never = Arc::new(MockTask::returning("never", json!({})));
        let reg = registry(vec![("ok", ok.clone()), ("bad", bad.clone()), ("never", never.clone())]);
        let config = PipelineConfig::default();

        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["ok", "bad", "never"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;

        assert!(!outcome.action.is_success());
        assert_eq!(outcome.executed, 2);
        assert_eq!(never.call_count(), 0);
        let exception = &outcome.action.stored_data["_exception"];
        assert_eq!(exception["_details"], json!("INCAR missing"));
        assert_eq!(exception["_task"], json!("bad"));
        assert_eq!(exception["_task_index"], json!(1));
    }

    #[tokio::test]
    async fn only_the_last_action_counts_unless_exit() {
        let advisory = FwAction::success().with_stored_data("advisory", json!(true));
        let first = Arc::new(MockTask::returning_action("first", json!({}), advisory));
        let last_action = FwAction::success().with_stored_data("final", json!(1));
        let second = Arc::new(MockTask::returning_action("second", json!({}), last_action.clone()));
        let reg = registry(vec![("first", first), ("second", second)]);
        let config = PipelineConfig::default();

        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["first", "second"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert_eq!(outcome.action, last_action);

        let exiting = Arc::new(MockTask::returning_action("exit", json!({}), FwAction::success().exiting()));
        let skipped = Arc::new(MockTask::returning("skipped", json!({})));
        let reg = registry(vec![("exit", exiting), ("skipped", skipped.clone())]);
        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["exit", "skipped"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert!(outcome.action.exit);
        assert_eq!(skipped.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_task_name_fizzles() {
        let reg = TaskRegistry::new();
        let config = PipelineConfig::default();
        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["{{missing.Task}}"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert!(outcome.action.error_detail().unwrap().contains("no task registered"));
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let boom = Arc::new(MockTask::panicking("boom", "segfault in disguise"));
        let reg = registry(vec![("boom", boom)]);
        let config = PipelineConfig::default();
        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["boom"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert_eq!(outcome.action.error_detail(), Some("task panicked: segfault in disguise"));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_retry_up_to_the_limit() {
        let flaky = Arc::new(MockTask::flaky("flaky", 2, json!({ "ok": true })));
        let reg = registry(vec![("flaky", flaky.clone())]);
        let config = PipelineConfig {
            task_retries: 2,
            retry_base_delay: Duration::from_millis(10),
        };
        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["flaky"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert!(outcome.action.is_success());
        assert_eq!(flaky.call_count(), 3);

        let stubborn = Arc::new(MockTask::failing_retryable("stubborn", "queue busy"));
        let reg = registry(vec![("stubborn", stubborn.clone())]);
        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["stubborn"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert!(!outcome.action.is_success());
        assert_eq!(stubborn.call_count(), 3);
    }

    #[tokio::test]
    async fn retryable_errors_stop_immediately_by_default() {
        let stubborn = Arc::new(MockTask::failing_retryable("stubborn", "queue busy"));
        let reg = registry(vec![("stubborn", stubborn.clone())]);
        let config = PipelineConfig::default();
        TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["stubborn"]), &Spec::new(), &TaskContext::default(), &NeverCancel)
            .await;
        assert_eq!(stubborn.call_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_task() {
        let a = Arc::new(MockTask::returning("a", json!({})));
        let b = Arc::new(MockTask::returning("b", json!({})));
        let reg = registry(vec![("a", a.clone()), ("b", b.clone())]);
        let config = PipelineConfig::default();
        let probe = CancelAfter(1, AtomicUsize::new(0));

        let outcome = TaskPipeline::new(&reg, &config)
            .run(&descriptors(&["a", "b"]), &Spec::new(), &TaskContext::default(), &probe)
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.executed, 1);
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 0);
        assert_eq!(outcome.action.stored_data["_cancelled"], json!(true));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), base);
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
        assert_eq!(backoff(base, 33), MAX_RETRY_DELAY);
        assert_eq!(backoff(Duration::from_secs(1), u32::MAX), MAX_RETRY_DELAY);
    }
}
