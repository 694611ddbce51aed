//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::AppError;
use crate::job::{Job, JobFilter};
use crate::stage::{StageEvent, StageReporter};
use crate::traits::{DueQuery, FetchBackend, Headers, InsertBatch, StorageBackend};

// ---------------------------------------------------------------------------
// MockFetchBackend
// ---------------------------------------------------------------------------

/// Mock fetch backend that serves one body for every URL.
///
/// Errors queued per URL with [`push_error`](Self::push_error) are returned
/// first, one per call.
#[derive(Clone)]
pub struct MockFetchBackend {
    body: Arc<Vec<u8>>,
    delay: Option<Duration>,
    errors: Arc<Mutex<HashMap<String, VecDeque<AppError>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    last_headers: Arc<Mutex<Option<Headers>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockFetchBackend {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Arc::new(body.into()),
            delay: None,
            errors: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            last_headers: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hold every fetch open for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_error(&self, url: &str, error: AppError) {
        self.errors
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(error);
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_headers(&self) -> Option<Headers> {
        self.last_headers.lock().unwrap().clone()
    }

    /// Highest number of fetches observed in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl FetchBackend for MockFetchBackend {
    async fn fetch(&self, url: &str, headers: &Headers) -> Result<Vec<u8>, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        *self.last_headers.lock().unwrap() = Some(headers.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let queued = self
            .errors
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(e) => Err(e),
            None => Ok(self.body.as_ref().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingBackend
// ---------------------------------------------------------------------------

/// Storage backend wrapper that records writes and can inject failures.
pub struct RecordingBackend<B> {
    inner: Arc<B>,
    batches: Arc<Mutex<Vec<InsertBatch>>>,
    outcomes: Arc<Mutex<Vec<Job>>>,
    fail_insert: Arc<AtomicBool>,
    fail_query: Arc<AtomicBool>,
    lose_outcome: Arc<AtomicBool>,
}

impl<B> Clone for RecordingBackend<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            batches: self.batches.clone(),
            outcomes: self.outcomes.clone(),
            fail_insert: self.fail_insert.clone(),
            fail_query: self.fail_query.clone(),
            lose_outcome: self.lose_outcome.clone(),
        }
    }
}

impl<B: StorageBackend> RecordingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner: Arc::new(inner),
            batches: Arc::new(Mutex::new(Vec::new())),
            outcomes: Arc::new(Mutex::new(Vec::new())),
            fail_insert: Arc::new(AtomicBool::new(false)),
            fail_query: Arc::new(AtomicBool::new(false)),
            lose_outcome: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Batches that reached the inner backend successfully.
    pub fn batches(&self) -> Vec<InsertBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<Job> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Make the next `insert_batch` fail with a database error.
    pub fn fail_next_insert(&self) {
        self.fail_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next `query_due` fail with a database error.
    pub fn fail_next_query(&self) {
        self.fail_query.store(true, Ordering::SeqCst);
    }

    /// Make the next `report_outcome` behave as if the row had vanished.
    pub fn lose_next_outcome(&self) {
        self.lose_outcome.store(true, Ordering::SeqCst);
    }
}

impl<B: StorageBackend> StorageBackend for RecordingBackend<B> {
    async fn query_due(&self, query: &DueQuery<'_>) -> Result<Vec<Job>, AppError> {
        if self.fail_query.swap(false, Ordering::SeqCst) {
            return Err(AppError::DatabaseError("injected query failure".into()));
        }
        self.inner.query_due(query).await
    }

    async fn insert_batch(&self, batch: &InsertBatch) -> Result<u64, AppError> {
        if self.fail_insert.swap(false, Ordering::SeqCst) {
            return Err(AppError::DatabaseError("injected insert failure".into()));
        }
        let created = self.inner.insert_batch(batch).await?;
        self.batches.lock().unwrap().push(batch.clone());
        Ok(created)
    }

    async fn report_outcome(&self, job: &Job) -> Result<(), AppError> {
        if self.lose_outcome.swap(false, Ordering::SeqCst) {
            return Err(AppError::NotFound {
                stage: job.stage.clone(),
                url: job.url.clone(),
            });
        }
        self.inner.report_outcome(job).await?;
        self.outcomes.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn get_job(&self, stage: &str, url: &str) -> Result<Option<Job>, AppError> {
        self.inner.get_job(stage, url).await
    }

    async fn list_jobs(
        &self,
        stage: &str,
        filter: JobFilter,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        self.inner.list_jobs(stage, filter, limit).await
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Stage reporter that keeps every processed job and event name.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<&'static str>>,
    processed: Mutex<Vec<Job>>,
    changed: Notify,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs reported as processed, in order.
    pub fn processed(&self) -> Vec<Job> {
        self.processed.lock().unwrap().clone()
    }

    /// How many events named `name` (e.g. `"Stopped"`) were reported.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| **event == name)
            .count()
    }

    /// Wait until at least `n` jobs were processed and return them.
    pub async fn wait_for_processed(&self, n: usize) -> Vec<Job> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let processed = self.processed();
            if processed.len() >= n {
                return processed;
            }
            notified.await;
        }
    }
}

impl StageReporter for RecordingReporter {
    fn report(&self, event: StageEvent<'_>) {
        let name = match &event {
            StageEvent::Started { .. } => "Started",
            StageEvent::Idle { .. } => "Idle",
            StageEvent::JobAcquired { .. } => "JobAcquired",
            StageEvent::JobSucceeded { .. } => "JobSucceeded",
            StageEvent::JobFailed { .. } => "JobFailed",
            StageEvent::JobProcessed { .. } => "JobProcessed",
            StageEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(name);

        if let StageEvent::JobProcessed { job } = event {
            self.processed.lock().unwrap().push(job.clone());
            self.changed.notify_waiters();
        }
    }
}
