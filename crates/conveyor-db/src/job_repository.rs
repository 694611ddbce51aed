use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use conveyor_core::error::AppError;
use conveyor_core::job::{Job, JobFilter};
use conveyor_core::traits::{DueQuery, InsertBatch, StorageBackend};

/// PostgreSQL storage backend over the `jobs` table, keyed by `(stage, url)`.
///
/// Safe to share between processes: the due query never claims rows, so
/// exclusivity comes from each stage's in-flight set.
#[derive(Clone)]
pub struct PgJobBackend {
    pool: Pool<Postgres>,
}

impl PgJobBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    stage: String,
    url: String,
    version: i64,
    attempt: i64,
    updated_at: DateTime<Utc>,
    error: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            url: row.url,
            stage: row.stage,
            version: u32::try_from(row.version).unwrap_or_default(),
            attempt: u32::try_from(row.attempt).unwrap_or_default(),
            timestamp: row.updated_at,
            error: row.error,
        }
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl StorageBackend for PgJobBackend {
    async fn query_due(&self, query: &DueQuery<'_>) -> Result<Vec<Job>, AppError> {
        let in_flight: Vec<String> = query.in_flight.iter().cloned().collect();
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT stage, url, version, attempt, updated_at, error
            FROM jobs
            WHERE stage = $1
              AND NOT (url = ANY($2))
              AND (
                    attempt = 0
                 OR (error IS NOT NULL AND attempt < $3)
                 OR version <> $4
                 OR ($5::timestamptz IS NOT NULL AND updated_at < $5)
              )
            ORDER BY updated_at ASC, url ASC
            LIMIT $6
            "#,
        )
        .bind(query.stage)
        .bind(&in_flight)
        .bind(i64::from(query.policy.max_attempts))
        .bind(i64::from(query.policy.version))
        .bind(query.policy.stale_before(query.now))
        .bind(sql_limit(query.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_batch(&self, batch: &InsertBatch) -> Result<u64, AppError> {
        if batch.urls.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (stage, url, version, attempt, updated_at)
            SELECT $1, url, $2, 0, NOW()
            FROM UNNEST($3::text[]) AS url
            ON CONFLICT (stage, url) DO NOTHING
            "#,
        )
        .bind(&batch.stage)
        .bind(i64::from(batch.version))
        .bind(&batch.urls)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn report_outcome(&self, job: &Job) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET version = $3, attempt = $4, updated_at = $5, error = $6
            WHERE stage = $1 AND url = $2
            "#,
        )
        .bind(&job.stage)
        .bind(&job.url)
        .bind(i64::from(job.version))
        .bind(i64::from(job.attempt))
        .bind(job.timestamp)
        .bind(job.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound {
                stage: job.stage.clone(),
                url: job.url.clone(),
            });
        }
        Ok(())
    }

    async fn get_job(&self, stage: &str, url: &str) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT stage, url, version, attempt, updated_at, error
            FROM jobs
            WHERE stage = $1 AND url = $2
            "#,
        )
        .bind(stage)
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list_jobs(
        &self,
        stage: &str,
        filter: JobFilter,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        let (failed_only, min_attempt) = match filter {
            JobFilter::All => (false, 0),
            JobFilter::Failed => (true, 0),
            JobFilter::Exhausted { max_attempts } => (true, i64::from(max_attempts)),
        };

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT stage, url, version, attempt, updated_at, error
            FROM jobs
            WHERE stage = $1
              AND (NOT $2 OR error IS NOT NULL)
              AND attempt >= $3
            ORDER BY updated_at ASC, url ASC
            LIMIT $4
            "#,
        )
        .bind(stage)
        .bind(failed_only)
        .bind(min_attempt)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.pool.close().await;
        Ok(())
    }
}
