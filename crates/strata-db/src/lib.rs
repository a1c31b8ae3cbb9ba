//! # strata-db
//!
//! PostgreSQL persistence for strata: the capture store, the job queue,
//! the reduced conversation/message/chunk artifacts and the derived
//! structure tables. Each entity gets its own typed repository; the
//! [`Database`] aggregate wires them all to one shared pool.

pub mod chunks;
pub mod conversations;
pub mod imports;
pub mod jobs;
#[cfg(feature = "memory")]
pub mod memory;
pub mod messages;
pub mod pool;
pub mod structure;
pub mod test_fixtures;

pub use chunks::PgChunkRepository;
pub use conversations::PgConversationRepository;
pub use imports::{compute_content_hash, PgImportRepository};
pub use jobs::PgJobRepository;
#[cfg(feature = "memory")]
pub use memory::MemoryStore;
pub use messages::PgMessageRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use structure::{PgDecisionRepository, PgStructureRepository, PgTaskRepository};

// Re-export core so consumers need only one import path.
pub use strata_core::*;

use sqlx::{Pool, Postgres};

/// All repositories over one shared connection pool.
pub struct Database {
    pool: Pool<Postgres>,
    pub jobs: PgJobRepository,
    pub imports: PgImportRepository,
    pub conversations: PgConversationRepository,
    pub messages: PgMessageRepository,
    pub chunks: PgChunkRepository,
    pub tasks: PgTaskRepository,
    pub decisions: PgDecisionRepository,
    pub structure: PgStructureRepository,
}

impl Database {
    /// Build the repository set over an existing pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            imports: PgImportRepository::new(pool.clone()),
            conversations: PgConversationRepository::new(pool.clone()),
            messages: PgMessageRepository::new(pool.clone()),
            chunks: PgChunkRepository::new(pool.clone()),
            tasks: PgTaskRepository::new(pool.clone()),
            decisions: PgDecisionRepository::new(pool.clone()),
            structure: PgStructureRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with default pool settings.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Connect with explicit pool settings.
    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(database_url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations. Compiled in only when the `migrations`
    /// feature is enabled; deployments that manage schema externally
    /// skip it.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// The shared connection pool, for callers that need raw SQL.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    #[cfg(test)]
    async fn connect_test() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| test_fixtures::DEFAULT_TEST_DATABASE_URL.to_string());
        Self::connect(&url).await
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL with migrated database
    async fn test_connect_and_clone_share_pool() {
        let db = Database::connect_test().await.unwrap();
        let cloned = db.clone();
        assert_eq!(db.pool().size(), cloned.pool().size());
    }
}
