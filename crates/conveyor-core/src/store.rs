//! The job store facade shared by every stage of a pipeline.
//!
//! `add` only buffers URLs. A [`Debouncer`] flushes the buffer to the
//! [`StorageBackend`] in batches, after which idle workers of the affected
//! stage are woken through a per-stage [`Notify`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;

use crate::error::AppError;
use crate::job::{DuePolicy, Job, JobFilter};
use crate::memory::MemoryBackend;
use crate::sync::{DebounceConfig, Debouncer};
use crate::traits::{DueQuery, InsertBatch, StorageBackend};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Flush once `add` has been quiet this long.
    pub quiet_period: Duration,
    /// Flush at the latest this long after the first buffered `add`.
    pub max_wait: Duration,
    /// Maximum jobs returned by one due query.
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(100),
            max_wait: Duration::from_millis(200),
            batch_size: 20,
        }
    }
}

impl StoreConfig {
    fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            quiet_period: self.quiet_period,
            max_wait: self.max_wait,
        }
    }
}

#[derive(Debug)]
struct PendingStage {
    version: u32,
    urls: BTreeSet<String>,
}

struct Shared<B> {
    backend: B,
    config: StoreConfig,
    pending: Mutex<HashMap<String, PendingStage>>,
    /// Serialises flushes so `close` observes every batch as written.
    flush_lock: tokio::sync::Mutex<()>,
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl<B: StorageBackend> Shared<B> {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingStage>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned pending buffer");
            poisoned.into_inner()
        })
    }

    fn signal(&self, stage: &str) -> Arc<Notify> {
        let mut signals = self.signals.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned signal map");
            poisoned.into_inner()
        });
        signals
            .entry(stage.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn take_pending(&self) -> Vec<InsertBatch> {
        self.lock_pending()
            .drain()
            .filter(|(_, pending)| !pending.urls.is_empty())
            .map(|(stage, pending)| InsertBatch {
                stage,
                version: pending.version,
                urls: pending.urls.into_iter().collect(),
            })
            .collect()
    }

    /// Put a batch that failed to insert back into the buffer.
    fn restore(&self, batch: InsertBatch) {
        let mut pending = self.lock_pending();
        let entry = pending.entry(batch.stage).or_insert_with(|| PendingStage {
            version: batch.version,
            urls: BTreeSet::new(),
        });
        entry.urls.extend(batch.urls);
    }

    async fn flush(&self) -> Result<u64, AppError> {
        let _guard = self.flush_lock.lock().await;
        let mut batches = self.take_pending().into_iter();
        let mut inserted = 0;

        while let Some(batch) = batches.next() {
            match self.backend.insert_batch(&batch).await {
                Ok(created) => {
                    tracing::debug!(
                        stage = %batch.stage,
                        submitted = batch.urls.len(),
                        created,
                        "Flushed job batch"
                    );
                    inserted += created;
                    if created > 0 {
                        self.signal(&batch.stage).notify_waiters();
                    }
                }
                Err(e) => {
                    tracing::error!(stage = %batch.stage, error = %e, "Failed to flush job batch");
                    self.restore(batch);
                    batches.for_each(|rest| self.restore(rest));
                    return Err(e);
                }
            }
        }
        Ok(inserted)
    }
}

/// Batching, notifying front of a [`StorageBackend`].
///
/// Cheap to clone; clones share the buffer, the backend and the flush task.
/// Construct inside a tokio runtime.
pub struct JobStore<B> {
    shared: Arc<Shared<B>>,
    debouncer: Arc<Debouncer>,
}

impl<B> Clone for JobStore<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            debouncer: self.debouncer.clone(),
        }
    }
}

impl JobStore<MemoryBackend> {
    /// A store over a fresh [`MemoryBackend`] with default timings.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new(), StoreConfig::default())
    }
}

impl<B: StorageBackend> JobStore<B> {
    pub fn new(backend: B, config: StoreConfig) -> Self {
        let shared = Arc::new(Shared {
            backend,
            config,
            pending: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            signals: Mutex::new(HashMap::new()),
        });

        let flusher = shared.clone();
        let debouncer = Debouncer::spawn(shared.config.debounce(), move || {
            let shared = flusher.clone();
            async move { shared.flush().await.is_ok() }
        });

        Self {
            shared,
            debouncer: Arc::new(debouncer),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Buffer URLs for `stage`. Returns how many were not already buffered.
    ///
    /// URLs become visible to [`query_due`](Self::query_due) once the
    /// debounced flush has run; URLs already stored for the stage are
    /// dropped at that point.
    pub fn add<I, S>(&self, stage: &str, version: u32, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = {
            let mut pending = self.shared.lock_pending();
            let entry = pending
                .entry(stage.to_string())
                .or_insert_with(|| PendingStage {
                    version,
                    urls: BTreeSet::new(),
                });
            entry.version = version;

            let mut added = 0;
            for url in urls {
                let url = url.into();
                if !url.is_empty() && entry.urls.insert(url) {
                    added += 1;
                }
            }
            added
        };

        if added > 0 {
            self.debouncer.trigger();
        }
        added
    }

    /// A producer handle that adds to `stage` at `version`.
    pub fn handle(&self, stage: impl Into<String>, version: u32) -> StageHandle<B> {
        StageHandle {
            stage: Arc::from(stage.into()),
            version,
            store: self.clone(),
        }
    }

    /// URLs buffered and not yet flushed, across all stages.
    pub fn pending_len(&self) -> usize {
        self.shared
            .lock_pending()
            .values()
            .map(|pending| pending.urls.len())
            .sum()
    }

    /// Write all buffered URLs now. Returns the number of jobs created.
    pub async fn flush(&self) -> Result<u64, AppError> {
        self.shared.flush().await
    }

    /// Due jobs of `stage`, oldest first, bounded by the configured batch size.
    pub async fn query_due(
        &self,
        stage: &str,
        policy: &DuePolicy,
        in_flight: &HashSet<String>,
    ) -> Result<Vec<Job>, AppError> {
        self.shared
            .backend
            .query_due(&DueQuery {
                stage,
                policy,
                in_flight,
                limit: self.shared.config.batch_size,
                now: Utc::now(),
            })
            .await
    }

    pub async fn report_outcome(&self, job: &Job) -> Result<(), AppError> {
        self.shared.backend.report_outcome(job).await
    }

    pub async fn get_job(&self, stage: &str, url: &str) -> Result<Option<Job>, AppError> {
        self.shared.backend.get_job(stage, url).await
    }

    pub async fn list_jobs(
        &self,
        stage: &str,
        filter: JobFilter,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        self.shared.backend.list_jobs(stage, filter, limit).await
    }

    /// The new-work signal of `stage`, fired after a flush created jobs for it.
    pub fn subscribe(&self, stage: &str) -> Arc<Notify> {
        self.shared.signal(stage)
    }

    /// Flush buffered URLs, then close the backend.
    ///
    /// Callers must not race `add` against `close`.
    pub async fn close(&self) -> Result<(), AppError> {
        self.flush().await?;
        self.shared.backend.close().await
    }
}

/// Cloneable producer side of a stage: lets a callback of one stage enqueue
/// work for another.
pub struct StageHandle<B> {
    stage: Arc<str>,
    version: u32,
    store: JobStore<B>,
}

impl<B> Clone for StageHandle<B> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            version: self.version,
            store: self.store.clone(),
        }
    }
}

impl<B: StorageBackend> StageHandle<B> {
    pub fn name(&self) -> &str {
        &self.stage
    }

    pub fn add<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store.add(&self.stage, self.version, urls)
    }

    pub fn store(&self) -> &JobStore<B> {
        &self.store
    }
}
