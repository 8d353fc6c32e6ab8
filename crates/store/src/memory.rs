//! In-process `Store` used for tests, local runs and as the default backend
//! of the CLI when no database is configured.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::{ChangeSet, Counters, FireworkRow, Snapshot, Store, StoreError, WorkflowRow};

#[derive(Debug, Default)]
struct Tables {
    workflows: BTreeMap<i64, WorkflowRow>,
    fireworks: BTreeMap<i64, FireworkRow>,
    counters: Counters,
}

/// Keeps rows in ordered maps behind a mutex.
///
/// `fail_next_commits` injects write failures so callers can verify that a
/// failed commit leaves them untouched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failures_pending: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn firework(&self, fw_id: i64) -> Option<FireworkRow> {
        self.tables.lock().unwrap().fireworks.get(&fw_id).cloned()
    }

    pub fn workflow(&self, wf_id: i64) -> Option<WorkflowRow> {
        self.tables.lock().unwrap().workflows.get(&wf_id).cloned()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self) -> Result<Snapshot, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Snapshot {
            workflows: tables.workflows.values().cloned().collect(),
            fireworks: tables.fireworks.values().cloned().collect(),
            counters: tables.counters,
        })
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            warn!("memory store rejecting commit (injected failure)");
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        // A single lock scope makes the whole change set visible at once.
        let mut tables = self.tables.lock().unwrap();
        for row in &changes.workflows {
            tables.workflows.insert(row.wf_id, row.clone());
        }
        for row in &changes.fireworks {
            tables.fireworks.insert(row.fw_id, row.clone());
        }
        if let Some(counters) = changes.counters {
            tables.counters = counters;
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn firework_row(fw_id: i64, state: &str) -> FireworkRow {
        FireworkRow {
            fw_id,
            wf_id: 1,
            name: format!("fw-{fw_id}"),
            state: state.into(),
            document: json!({ "fw_id": fw_id, "state": state }),
            updated_on: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_then_load_returns_rows_in_id_order() {
        let store = MemoryStore::new();
        let changes = ChangeSet {
            fireworks: vec![firework_row(2, "WAITING"), firework_row(1, "READY")],
            counters: Some(Counters { next_fw_id: 3, ..Counters::default() }),
            ..ChangeSet::default()
        };

        store.commit(&changes).await.unwrap();
        let snapshot = store.load().await.unwrap();

        let ids: Vec<i64> = snapshot.fireworks.iter().map(|r| r.fw_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(snapshot.counters.next_fw_id, 3);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn injected_failure_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);

        let changes = ChangeSet {
            fireworks: vec![firework_row(1, "READY")],
            ..ChangeSet::default()
        };
        assert!(matches!(store.commit(&changes).await, Err(StoreError::Unavailable(_))));
        assert!(store.firework(1).is_none());

        // The failure budget is spent; the retry goes through.
        store.commit(&changes).await.unwrap();
        assert_eq!(store.firework(1).unwrap().state, "READY");
    }
}
