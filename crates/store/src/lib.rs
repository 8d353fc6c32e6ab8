//! `store` crate — pure persistence layer.
//!
//! Provides the [`Store`] trait the engine commits its transactions through,
//! the row types that cross that boundary, an in-memory implementation and a
//! Postgres implementation backed by a connection pool and repository
//! functions. No business logic lives here: documents are opaque JSON.

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{ChangeSet, Counters, FireworkRow, Snapshot, WorkflowRow};
pub use postgres::{DbPool, PgStore};
pub use traits::Store;
