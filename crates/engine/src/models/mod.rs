//! Core domain models for the engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. Each firework (with its launches embedded) and each workflow is
//! serialised to the JSON `document` column of its store row.

pub mod firework;
pub mod launch;
pub mod state;
pub mod timestamp;
pub mod worker;
pub mod workflow;

pub use firework::{Firework, FwSpec};
pub use launch::{Launch, StateHistoryEntry, Tracker};
pub use state::FwState;
pub use worker::FWorker;
pub use workflow::Workflow;

/// Global firework id.
pub type FwId = i64;
/// Global launch id.
pub type LaunchId = i64;
/// Global workflow id.
pub type WfId = i64;
