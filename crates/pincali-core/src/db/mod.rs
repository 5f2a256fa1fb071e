pub mod canonical;
pub mod manifest;
pub mod migrations;
pub mod queue;
pub mod runs;

pub use canonical::RemovalCandidate;
pub use migrations::apply_migrations;
pub use queue::{AtomicClaim, ClaimStrategy, CompareAndSwapClaim};
pub use runs::{RunCounters, SyncSummary, TierSummary};

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// How many ids go into one IN-clause. Keeps statements bounded the same way
/// the batched REST reads were.
pub(crate) const QUERY_BATCH_SIZE: usize = 200;

/// Batch size for manifest upserts.
pub(crate) const UPSERT_BATCH_SIZE: usize = 50;

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) a database file and bring the schema up to
    /// date.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        apply_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database with the full schema. Test constructor; the pool is
    /// pinned to one connection so every query sees the same memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        apply_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
