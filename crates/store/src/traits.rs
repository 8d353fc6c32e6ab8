//! The `Store` trait — what the engine needs from a persistence backend.

use async_trait::async_trait;

use crate::{ChangeSet, Snapshot, StoreError};

/// Durable backing for the engine's arena.
///
/// `commit` must be atomic: either every row in the change set is written or
/// none is. The engine only applies a transaction to its in-memory state
/// after `commit` returned `Ok`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load every workflow, firework and the id counters.
    async fn load(&self) -> Result<Snapshot, StoreError>;

    /// Persist one transaction's writes.
    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError>;
}
