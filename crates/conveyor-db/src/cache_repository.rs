use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;

use conveyor_core::cache::cache_key;
use conveyor_core::error::AppError;
use conveyor_core::traits::ContentCache;

/// Persistent content cache over the `content_cache` table.
///
/// Rows are keyed by the SHA-256 of the URL. Expired rows read as misses
/// until [`purge_expired`](Self::purge_expired) deletes them.
#[derive(Clone)]
pub struct PgContentCache {
    pool: PgPool,
    ttl: Option<TimeDelta>,
}

impl PgContentCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, ttl: None }
    }

    /// Entries written from now on expire after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Result<Self, AppError> {
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|e| AppError::ConfigError(format!("Cache TTL out of range: {e}")))?;
        self.ttl = Some(ttl);
        Ok(self)
    }

    fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl.and_then(|ttl| now.checked_add_signed(ttl))
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM content_cache WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(e.to_string()))?;

        if result.rows_affected() > 0 {
            tracing::debug!(purged = result.rows_affected(), "Purged expired cache entries");
        }
        Ok(result.rows_affected())
    }
}

impl ContentCache for PgContentCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let body: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT body FROM content_cache
            WHERE cache_key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(cache_key(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(e.to_string()))?;

        Ok(body)
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO content_cache (cache_key, url, body, stored_at, expires_at)
            VALUES ($1, $2, $3, NOW(), $4)
            ON CONFLICT (cache_key) DO UPDATE
            SET url = EXCLUDED.url,
                body = EXCLUDED.body,
                stored_at = EXCLUDED.stored_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(cache_key(key))
        .bind(key)
        .bind(bytes)
        .bind(self.expires_at(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(e.to_string()))?;

        Ok(())
    }
}
