//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour. The
//! `document` column holds the full serialised domain object; the scalar
//! columns duplicate a few fields for indexing. Domain types live in the
//! `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub wf_id: i64,
    pub name: String,
    pub state: String,
    /// Full JSON workflow document (nodes, links, metadata, fw_states, …)
    pub document: serde_json::Value,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// fireworks
// ---------------------------------------------------------------------------

/// A persisted firework row. Launches are embedded in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FireworkRow {
    pub fw_id: i64,
    pub wf_id: i64,
    pub name: String,
    pub state: String,
    pub document: serde_json::Value,
    pub updated_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// counters
// ---------------------------------------------------------------------------

/// Next free ids, persisted with every transaction that allocates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub next_fw_id: i64,
    pub next_launch_id: i64,
    pub next_wf_id: i64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            next_fw_id: 1,
            next_launch_id: 1,
            next_wf_id: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction payloads
// ---------------------------------------------------------------------------

/// Everything one engine transaction wrote. Committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub workflows: Vec<WorkflowRow>,
    pub fireworks: Vec<FireworkRow>,
    /// Present only when the transaction allocated ids.
    pub counters: Option<Counters>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.fireworks.is_empty() && self.counters.is_none()
    }
}

/// Full contents of a store, used to rebuild the engine on start-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub workflows: Vec<WorkflowRow>,
    pub fireworks: Vec<FireworkRow>,
    pub counters: Counters,
}
