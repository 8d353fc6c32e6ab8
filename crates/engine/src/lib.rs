//! `engine` crate — the launchpad: workflow documents, the firework state
//! machine, worker claims and the task pipeline that executes a launch.
//!
//! Every mutation runs as a transaction over an in-memory arena and is
//! committed through a [`store::Store`] before it becomes visible.

pub mod compose;
pub mod config;
pub mod dag;
pub mod dict_mod;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod rocket;
pub mod sweeper;
mod txn;

pub use compose::{powerups, FireworkSpec, WorkflowSpec};
pub use config::{EngineConfig, PipelineConfig, RerunPolicy, RocketConfig, SweeperConfig};
pub use dag::validate_dag;
pub use engine::Engine;
pub use error::{EngineError, StructuralError};
pub use lifecycle::{Claim, CompletionReport, Insertion, RuntimeInfo, StalledBranch, Submitted};
pub use models::{FWorker, Firework, FwId, FwSpec, FwState, Launch, LaunchId, Tracker, WfId, Workflow};
pub use pipeline::{CancellationProbe, NeverCancel, PipelineOutcome, TaskPipeline};
pub use query::Query;
pub use rocket::{LaunchReport, Rocket};
pub use sweeper::{SweepReport, Sweeper};
