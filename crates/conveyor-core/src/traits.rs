use std::collections::{BTreeMap, HashSet};
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::job::{DuePolicy, Job, JobFilter};

/// Request headers, sorted for stable logging.
pub type Headers = BTreeMap<String, String>;

/// Arguments of a due-job query for one stage.
#[derive(Debug, Clone)]
pub struct DueQuery<'a> {
    pub stage: &'a str,
    pub policy: &'a DuePolicy,
    /// URLs currently being processed by the stage; never returned.
    pub in_flight: &'a HashSet<String>,
    pub limit: usize,
    pub now: DateTime<Utc>,
}

/// New URLs for one stage, already deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertBatch {
    pub stage: String,
    pub version: u32,
    pub urls: Vec<String>,
}

/// Durable record of jobs, shared by every stage of a pipeline.
///
/// Implementations must keep `(stage, url)` unique.
pub trait StorageBackend: Send + Sync + 'static {
    /// Jobs of `query.stage` that are due, excluding in-flight URLs,
    /// oldest `timestamp` first, at most `query.limit`.
    fn query_due(
        &self,
        query: &DueQuery<'_>,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    /// Insert the batch as fresh jobs, skipping URLs that already exist for
    /// the stage. Returns the number of rows created.
    fn insert_batch(
        &self,
        batch: &InsertBatch,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Overwrite the row for `(job.stage, job.url)`.
    ///
    /// Fails with [`AppError::NotFound`] if the row does not exist.
    fn report_outcome(&self, job: &Job) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        stage: &str,
        url: &str,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Jobs of a stage matching `filter`, oldest `timestamp` first.
    fn list_jobs(
        &self,
        stage: &str,
        filter: JobFilter,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}

/// Key to bytes store consulted before downloading.
///
/// Eviction and expiry are the backend's business; the caller only ever
/// observes misses.
pub trait ContentCache: Send + Sync + Clone + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, AppError>> + Send;

    fn set(&self, key: &str, bytes: &[u8]) -> impl Future<Output = Result<(), AppError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}

/// Downloads the bytes behind a URL.
pub trait FetchBackend: Send + Sync + Clone + 'static {
    /// Non-success statuses and transport failures are errors.
    fn fetch(
        &self,
        url: &str,
        headers: &Headers,
    ) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;
}

/// A cache that never hits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ContentCache for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, AppError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _bytes: &[u8]) -> Result<(), AppError> {
        Ok(())
    }
}
