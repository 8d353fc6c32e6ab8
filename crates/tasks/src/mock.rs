//! `MockTask` — a test double for `FireTask`.
//!
//! Useful in unit and integration tests where a real task implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{FireTask, FwAction, Spec, TaskContext, TaskError, TaskOutput};

/// Behaviour injected into `MockTask` at construction time.
pub enum MockBehaviour {
    /// Return the given object as the spec fragment.
    ReturnValue(Value),
    /// Return the given fragment together with an action.
    ReturnAction(Value, FwAction),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `n` calls, then succeed.
    FlakyThenReturn(usize, Value),
    /// Panic inside `run`.
    Panic(String),
}

/// A mock task that records every spec it receives and returns a
/// programmer-specified result.
pub struct MockTask {
    /// Label used in test assertions.
    pub name: String,
    /// What the task will do when `run` is called.
    pub behaviour: MockBehaviour,
    /// All specs seen by this task (in call order).
    pub calls: Arc<Mutex<Vec<Spec>>>,
    attempts: AtomicUsize,
}

impl MockTask {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds with the given fragment.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that succeeds with a fragment and an action.
    pub fn returning_action(name: impl Into<String>, value: Value, action: FwAction) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnAction(value, action))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FlakyThenReturn(failures, value))
    }

    /// Create a mock that panics when run.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Number of times this task has been run.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Spec seen by the most recent call.
    pub fn last_spec(&self) -> Option<Spec> {
        self.calls.lock().unwrap().last().cloned()
    }

    /// Merge the task's own name with `v` so tests can trace the data flowing
    /// through the pipeline.
    fn fragment(&self, v: &Value) -> Spec {
        let mut out = Spec::new();
        out.insert("last_task".into(), json!(self.name));
        if let Some(v_obj) = v.as_object() {
            for (k, val) in v_obj {
                out.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl FireTask for MockTask {
    async fn run(
        &self,
        _params: &Spec,
        spec: &Spec,
        _ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        self.calls.lock().unwrap().push(spec.clone());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(TaskOutput::with_update(self.fragment(v))),
            MockBehaviour::ReturnAction(v, action) => {
                Ok(TaskOutput::with_update(self.fragment(v)).with_action(action.clone()))
            }
            MockBehaviour::FailRetryable(msg) => Err(TaskError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(TaskError::Fatal(msg.clone())),
            MockBehaviour::FlakyThenReturn(failures, v) => {
                if attempt < *failures {
                    Err(TaskError::Retryable(format!("flaky attempt {}", attempt + 1)))
                } else {
                    Ok(TaskOutput::with_update(self.fragment(v)))
                }
            }
            MockBehaviour::Panic(msg) => panic!("{}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_traces_name() {
        let task = MockTask::returning("write_input", json!({ "step": 1 }));
        let mut spec = Spec::new();
        spec.insert("job_type".into(), json!("opt"));

        let out = task
            .run(&Spec::new(), &spec, &TaskContext::default())
            .await
            .unwrap();

        assert_eq!(task.call_count(), 1);
        assert_eq!(task.last_spec().unwrap()["job_type"], "opt");
        assert_eq!(out.update["last_task"], "write_input");
        assert_eq!(out.update["step"], 1);
        assert!(out.action.is_none());
    }

    #[tokio::test]
    async fn flaky_task_recovers_after_failures() {
        let task = MockTask::flaky("flaky", 2, json!({}));
        let ctx = TaskContext::default();

        assert!(matches!(task.run(&Spec::new(), &Spec::new(), &ctx).await, Err(TaskError::Retryable(_))));
        assert!(matches!(task.run(&Spec::new(), &Spec::new(), &ctx).await, Err(TaskError::Retryable(_))));
        assert!(task.run(&Spec::new(), &Spec::new(), &ctx).await.is_ok());
        assert_eq!(task.call_count(), 3);
    }
}
