use conveyor_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::cache_repository::PgContentCache;
use crate::config::DatabaseConfig;
use crate::job_repository::PgJobBackend;

/// Entry point to the PostgreSQL side of a pipeline.
///
/// One pool backs both the job table and the content cache; the backends
/// handed out here are cheap clones over it.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and bring the schema up to date. What the binary uses.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, AppError> {
        let db = Self::connect(config).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Connect without touching the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(
            max_connections = config.max_connections,
            acquire_timeout = ?config.acquire_timeout,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations (`jobs`, `content_cache`). Safe to repeat.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))
    }

    /// Round-trip a trivial query to check the server is reachable.
    pub async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Ping failed: {e}")))?;
        Ok(())
    }

    /// Storage backend for a [`JobStore`](conveyor_core::JobStore).
    pub fn job_backend(&self) -> PgJobBackend {
        PgJobBackend::new(self.pool.clone())
    }

    /// Content cache whose entries never expire; see
    /// [`PgContentCache::with_ttl`].
    pub fn content_cache(&self) -> PgContentCache {
        PgContentCache::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
