//! Engine-level error types.

use thiserror::Error;

use crate::dict_mod::ModError;
use crate::models::{FwId, FwState, LaunchId, WfId};

/// A workflow (or a change to one) that would break the DAG invariants.
/// Always rejected before anything is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("workflow has no fireworks")]
    EmptyWorkflow,

    /// Two or more fireworks share the same id.
    #[error("duplicate firework id: {0}")]
    DuplicateNodeId(FwId),

    /// A link references a firework id that doesn't exist in the workflow.
    #[error("link references unknown firework {node_id} ({side} side)")]
    UnknownNodeReference { node_id: FwId, side: &'static str },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// Linking the inserted fragment would close a loop through these nodes.
    #[error("inserting between {parent} and {child} would create a cycle")]
    InsertionCycle { parent: FwId, child: FwId },

    /// An `update_targets` entry is not downstream of the completing node.
    #[error("update target {target} is not downstream of firework {fw_id}")]
    BadUpdateTarget { fw_id: FwId, target: FwId },

    #[error("invalid sub-workflow: {0}")]
    InvalidSubWorkflow(String),

    #[error("invalid mod_spec: {0}")]
    InvalidModSpec(#[from] ModError),
}

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------
    #[error(transparent)]
    Structural(#[from] StructuralError),

    // ------ Lookup errors ------
    #[error("firework {0} not found")]
    FireworkNotFound(FwId),

    #[error("launch {0} not found")]
    LaunchNotFound(LaunchId),

    #[error("workflow {0} not found")]
    WorkflowNotFound(WfId),

    // ------ State machine errors ------
    #[error("firework {fw_id} cannot move from {from} to {to}")]
    InvalidTransition { fw_id: FwId, from: FwState, to: FwState },

    /// The launch no longer holds its firework (finished, cancelled or
    /// timed out).
    #[error("launch {launch_id} is not active (state {state})")]
    LaunchNotActive { launch_id: LaunchId, state: FwState },

    /// A different outcome was already recorded for this launch.
    #[error("launch {launch_id} already finished as {state}")]
    LaunchAlreadyFinished { launch_id: LaunchId, state: FwState },

    /// Another worker reserved the firework first.
    #[error("firework {fw_id} was taken concurrently (now {found})")]
    ClaimConflict { fw_id: FwId, found: FwState },

    // ------ Persistence errors ------
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::ClaimConflict { .. } | EngineError::Store(_))
    }
}
