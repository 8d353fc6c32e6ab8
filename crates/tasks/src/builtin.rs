//! Built-in tasks that ship with the engine.
//!
//! Domain plugins (input writers, solver runners, parsers) live outside this
//! crate; these cover the generic plumbing every deployment needs.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{FireTask, FwAction, Spec, TaskContext, TaskError, TaskOutput};

fn parse_params<T: for<'de> Deserialize<'de>>(params: &Spec) -> Result<T, TaskError> {
    Ok(serde_json::from_value(Value::Object(params.clone()))?)
}

// ---------------------------------------------------------------------------
// ScriptTask
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptSource {
    One(String),
    Many(Vec<String>),
}

impl ScriptSource {
    fn lines(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(lines) => lines.iter().map(String::as_str).collect(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ScriptParams {
    script: ScriptSource,
    #[serde(default = "default_true")]
    fizzle_bad_rc: bool,
    #[serde(default)]
    store_stdout: bool,
    #[serde(default)]
    store_stderr: bool,
    #[serde(default)]
    defuse_bad_rc: bool,
}

/// Runs shell commands in the launch directory.
///
/// String values of the worker environment are exported as environment
/// variables, so scripts can find executables and credentials the worker
/// advertises. A non-zero exit code fizzles the launch unless
/// `fizzle_bad_rc` is false.
pub struct ScriptTask;

#[async_trait]
impl FireTask for ScriptTask {
    async fn run(
        &self,
        params: &Spec,
        _spec: &Spec,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        let params: ScriptParams = parse_params(params)?;
        let script = params.script.lines().join(" && ");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if ctx.launch_dir.is_dir() {
            cmd.current_dir(&ctx.launch_dir);
        }
        for (key, value) in &ctx.env {
            if let Some(s) = value.as_str() {
                cmd.env(key, s);
            }
        }

        debug!(fw_id = ctx.fw_id, launch_id = ctx.launch_id, %script, "running script");
        let output = cmd.output().await?;
        let returncode = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if returncode != 0 && params.fizzle_bad_rc {
            return Err(TaskError::Fatal(format!(
                "script exited with return code {returncode}: {}",
                stderr.trim()
            )));
        }

        let mut action = FwAction::success().with_stored_data("returncode", json!(returncode));
        if params.store_stdout {
            action = action.with_stored_data("stdout", json!(stdout));
        }
        if params.store_stderr {
            action = action.with_stored_data("stderr", json!(stderr));
        }
        if returncode != 0 && params.defuse_bad_rc {
            action = action.defusing_children();
        }

        info!(fw_id = ctx.fw_id, returncode, "script finished");
        Ok(TaskOutput::empty().with_action(action))
    }
}

// ---------------------------------------------------------------------------
// FileWriteTask
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FileToWrite {
    filename: String,
    contents: Value,
}

#[derive(Debug, Deserialize)]
struct FileWriteParams {
    files_to_write: Vec<FileToWrite>,
    #[serde(default)]
    dest: Option<PathBuf>,
}

/// Writes files into the launch directory (or `dest`).
///
/// String contents are written verbatim; anything else is written as
/// pretty-printed JSON.
pub struct FileWriteTask;

#[async_trait]
impl FireTask for FileWriteTask {
    async fn run(
        &self,
        params: &Spec,
        _spec: &Spec,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        let params: FileWriteParams = parse_params(params)?;
        let dest = params.dest.unwrap_or_else(|| ctx.launch_dir.clone());
        tokio::fs::create_dir_all(&dest).await?;

        for file in &params.files_to_write {
            let contents = match &file.contents {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)?,
            };
            tokio::fs::write(dest.join(&file.filename), contents).await?;
        }

        Ok(TaskOutput::empty())
    }
}

// ---------------------------------------------------------------------------
// ModSpecTask
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ModSpecParams {
    #[serde(default)]
    update_spec: Spec,
    #[serde(default)]
    mod_spec: Vec<Value>,
    #[serde(default)]
    propagate: bool,
}

/// Emits an action that updates downstream specs.
pub struct ModSpecTask;

#[async_trait]
impl FireTask for ModSpecTask {
    async fn run(
        &self,
        params: &Spec,
        _spec: &Spec,
        _ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        let params: ModSpecParams = parse_params(params)?;
        let mut action = FwAction::success().with_update_spec(params.update_spec);
        action.mod_spec = params.mod_spec;
        action.propagate = params.propagate;
        Ok(TaskOutput::empty().with_action(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Spec {
        value.as_object().cloned().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_task_exports_worker_env_and_records_returncode() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = Spec::new();
        env.insert("SOLVER_CMD".into(), json!("qchem"));
        let ctx = TaskContext {
            launch_dir: dir.path().to_path_buf(),
            env,
            ..TaskContext::default()
        };

        let out = ScriptTask
            .run(
                &params(json!({ "script": "echo $SOLVER_CMD", "store_stdout": true })),
                &Spec::new(),
                &ctx,
            )
            .await
            .unwrap();

        let action = out.action.unwrap();
        assert_eq!(action.stored_data["returncode"], 0);
        assert_eq!(action.stored_data["stdout"], "qchem\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_task_fails_on_bad_return_code() {
        let err = ScriptTask
            .run(&params(json!({ "script": ["true", "exit 3"] })), &Spec::new(), &TaskContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Fatal(msg) if msg.contains("return code 3")));
    }

    #[tokio::test]
    async fn file_write_task_writes_into_launch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TaskContext {
            launch_dir: dir.path().join("launcher_1"),
            ..TaskContext::default()
        };

        FileWriteTask
            .run(
                &params(json!({
                    "files_to_write": [
                        { "filename": "mol.qin", "contents": "$molecule\n0 1\n$end" },
                        { "filename": "meta.json", "contents": { "charge": 0 } }
                    ]
                })),
                &Spec::new(),
                &ctx,
            )
            .await
            .unwrap();

        let qin = std::fs::read_to_string(ctx.launch_dir.join("mol.qin")).unwrap();
        assert!(qin.starts_with("$molecule"));
        let meta: Value =
            serde_json::from_str(&std::fs::read_to_string(ctx.launch_dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta["charge"], 0);
    }

    #[tokio::test]
    async fn mod_spec_task_emits_downstream_updates() {
        let out = ModSpecTask
            .run(
                &params(json!({
                    "update_spec": { "prev_calc_dir": "/scratch/1" },
                    "mod_spec": [{ "_push": { "history": "opt" } }],
                    "propagate": true
                })),
                &Spec::new(),
                &TaskContext::default(),
            )
            .await
            .unwrap();

        let action = out.action.unwrap();
        assert_eq!(action.update_spec["prev_calc_dir"], "/scratch/1");
        assert_eq!(action.mod_spec.len(), 1);
        assert!(action.propagate);
    }

    #[tokio::test]
    async fn missing_params_are_fatal() {
        let err = ScriptTask
            .run(&Spec::new(), &Spec::new(), &TaskContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Fatal(_)));
    }
}
