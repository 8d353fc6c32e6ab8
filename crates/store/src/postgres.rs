//! Postgres-backed `Store`.
//!
//! Each engine transaction becomes one SQL transaction of upserts, so a
//! crash or constraint failure mid-way leaves the database at the previous
//! commit.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info, instrument};

use crate::repository::{counters, fireworks, workflows};
use crate::{ChangeSet, Snapshot, Store, StoreError};

/// Type alias for the shared Postgres pool used across the whole application.
pub type DbPool = PgPool;

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url` with at most `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!("Connecting to database (max_connections={})", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded migrations from the workspace `migrations/` dir.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self))]
    async fn load(&self) -> Result<Snapshot, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let snapshot = Snapshot {
            workflows: workflows::list_workflows(&mut conn).await?,
            fireworks: fireworks::list_fireworks(&mut conn).await?,
            counters: counters::load_counters(&mut conn).await?,
        };
        info!(
            workflows = snapshot.workflows.len(),
            fireworks = snapshot.fireworks.len(),
            "loaded store snapshot"
        );
        Ok(snapshot)
    }

    #[instrument(skip_all, fields(workflows = changes.workflows.len(), fireworks = changes.fireworks.len()))]
    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // Workflows first: fireworks reference them.
        for row in &changes.workflows {
            workflows::upsert_workflow(&mut tx, row).await?;
        }
        for row in &changes.fireworks {
            fireworks::upsert_firework(&mut tx, row).await?;
        }
        if let Some(next) = &changes.counters {
            counters::save_counters(&mut tx, next).await?;
        }

        tx.commit().await?;
        debug!("change set committed");
        Ok(())
    }
}
