use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::{Result, StoreError};

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub use models::{Chunk, Collection, NewChunk};
pub use queries::{ChunkQueries, CollectionQueries};

pub type DbPool = Pool<Sqlite>;

/// Registry database handle. WAL mode keeps readers from blocking each
/// other or writers; the busy timeout bounds lock waits on concurrent
/// structural changes.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P, busy_timeout_ms: u64) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to open registry database: {e}")))?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running registry migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to run registry migration: {e}")))?;

        debug!("Registry migrations completed successfully");
        Ok(())
    }

    /// Reclaim space and refresh planner statistics.
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing registry database");

        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;

        debug!("Registry optimization completed");
        Ok(())
    }
}
