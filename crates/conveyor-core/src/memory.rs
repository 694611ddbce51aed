use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::error::AppError;
use crate::job::{Job, JobFilter};
use crate::traits::{DueQuery, InsertBatch, StorageBackend};

type StageJobs = BTreeMap<String, Job>;

/// In-process storage backend. Jobs live as long as the value does.
///
/// The default backend for tests and single-run crawls.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    stages: Arc<Mutex<HashMap<String, StageJobs>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StageJobs>> {
        self.stages.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job map");
            poisoned.into_inner()
        })
    }

    /// Total number of jobs across all stages.
    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn oldest_first(mut jobs: Vec<Job>, limit: usize) -> Vec<Job> {
    jobs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.url.cmp(&b.url)));
    jobs.truncate(limit);
    jobs
}

impl StorageBackend for MemoryBackend {
    async fn query_due(&self, query: &DueQuery<'_>) -> Result<Vec<Job>, AppError> {
        let stages = self.lock();
        let Some(jobs) = stages.get(query.stage) else {
            return Ok(Vec::new());
        };
        let due = jobs
            .values()
            .filter(|job| !query.in_flight.contains(&job.url))
            .filter(|job| job.is_due(query.policy, query.now))
            .cloned()
            .collect();
        Ok(oldest_first(due, query.limit))
    }

    async fn insert_batch(&self, batch: &InsertBatch) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut stages = self.lock();
        let jobs = stages.entry(batch.stage.clone()).or_default();
        let mut inserted = 0;
        for url in &batch.urls {
            if !jobs.contains_key(url) {
                jobs.insert(url.clone(), Job::new(&batch.stage, url, batch.version, now));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn report_outcome(&self, job: &Job) -> Result<(), AppError> {
        let mut stages = self.lock();
        let row = stages
            .get_mut(&job.stage)
            .and_then(|jobs| jobs.get_mut(&job.url))
            .ok_or_else(|| AppError::NotFound {
                stage: job.stage.clone(),
                url: job.url.clone(),
            })?;
        *row = job.clone();
        Ok(())
    }

    async fn get_job(&self, stage: &str, url: &str) -> Result<Option<Job>, AppError> {
        Ok(self
            .lock()
            .get(stage)
            .and_then(|jobs| jobs.get(url))
            .cloned())
    }

    async fn list_jobs(
        &self,
        stage: &str,
        filter: JobFilter,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        let stages = self.lock();
        let matching = stages
            .get(stage)
            .map(|jobs| {
                jobs.values()
                    .filter(|job| filter.matches(job))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(oldest_first(matching, limit))
    }
}
