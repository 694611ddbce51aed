//! Per-stage worker pool.
//!
//! Every worker loops over: acquire the next due job, download it, run the
//! stage's processors, write the outcome back. Acquisition is serialised by
//! the stage's queue lock, and a URL joins the in-flight set before that
//! lock is released, so no two workers ever hold the same job.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::downloader::Downloader;
use crate::error::AppError;
use crate::job::{DuePolicy, Job, StageConfig};
use crate::processor::{ProcessContext, Processor};
use crate::store::{JobStore, StageHandle};
use crate::traits::{ContentCache, FetchBackend, StorageBackend};

/// Longest an idle worker waits before polling the store again.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Events emitted by stage workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum StageEvent<'a> {
    Started {
        stage: &'a str,
        worker: usize,
    },
    /// No due job; the worker is waiting for new work or the idle timeout.
    Idle {
        stage: &'a str,
        worker: usize,
    },
    JobAcquired {
        job: &'a Job,
    },
    JobSucceeded {
        job: &'a Job,
    },
    JobFailed {
        job: &'a Job,
        error: &'a AppError,
        will_retry: bool,
    },
    /// Emitted exactly once per attempt, whatever the outcome. Carries the
    /// job as written back, or as selected if nothing was written.
    JobProcessed {
        job: &'a Job,
    },
    Stopped {
        stage: &'a str,
        worker: usize,
    },
}

/// Trait for receiving stage events (decoupled logging).
pub trait StageReporter: Send + Sync {
    fn report(&self, event: StageEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStageReporter;

impl StageReporter for TracingStageReporter {
    fn report(&self, event: StageEvent<'_>) {
        match event {
            StageEvent::Started { stage, worker } => {
                tracing::debug!(%stage, worker, "Worker started");
            }
            StageEvent::Idle { stage, worker } => {
                tracing::trace!(%stage, worker, "Waiting for due jobs");
            }
            StageEvent::JobAcquired { job } => {
                tracing::debug!(stage = %job.stage, url = %job.url, attempt = job.attempt, "Job acquired");
            }
            StageEvent::JobSucceeded { job } => {
                tracing::info!(stage = %job.stage, url = %job.url, "Job succeeded");
            }
            StageEvent::JobFailed {
                job,
                error,
                will_retry,
            } => {
                tracing::warn!(
                    stage = %job.stage,
                    url = %job.url,
                    attempt = job.attempt,
                    kind = error.kind(),
                    %error,
                    will_retry,
                    "Job failed"
                );
            }
            StageEvent::JobProcessed { .. } => {}
            StageEvent::Stopped { stage, worker } => {
                tracing::debug!(%stage, worker, "Worker stopped");
            }
        }
    }
}

/// Options for [`Stage::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Propagate the first download/processing error out of `run` instead of
    /// recording it as a retryable failure.
    pub fail_fast: bool,
    /// Cancelling makes `run` return `Ok(())` once in-progress attempts end.
    pub shutdown: CancellationToken,
}

impl RunOptions {
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }
}

/// A job claimed by one worker. Dropping it releases the URL from the
/// stage's in-flight set.
struct Claim<'a> {
    job: Job,
    in_flight: &'a Mutex<HashSet<String>>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock_set(self.in_flight).remove(&self.job.url);
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned in-flight set");
        poisoned.into_inner()
    })
}

/// A named processing stage: its configuration, processors and worker pool.
pub struct Stage<B, F, C>
where
    B: StorageBackend,
    F: FetchBackend,
    C: ContentCache,
{
    config: StageConfig,
    policy: DuePolicy,
    store: JobStore<B>,
    downloader: Downloader<F, C>,
    processors: Vec<Processor>,
    /// Locally prefetched due jobs; its lock is the acquisition lock.
    queue: tokio::sync::Mutex<VecDeque<Job>>,
    in_flight: Mutex<HashSet<String>>,
    idle_timeout: Duration,
}

impl<B, F, C> Stage<B, F, C>
where
    B: StorageBackend,
    F: FetchBackend,
    C: ContentCache,
{
    pub fn new(
        config: StageConfig,
        store: JobStore<B>,
        downloader: Downloader<F, C>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            policy: config.policy(),
            config,
            store,
            downloader,
            processors: Vec::new(),
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashSet::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Register a processor. Processors run in registration order on the
    /// same download.
    pub fn with_processor(mut self, processor: Processor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore<B> {
        &self.store
    }

    /// A cloneable producer handle for this stage.
    pub fn handle(&self) -> StageHandle<B> {
        self.store.handle(self.config.name.clone(), self.config.version)
    }

    /// Enqueue URLs for this stage.
    pub fn add<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store.add(&self.config.name, self.config.version, urls)
    }

    /// URLs currently being processed by this stage's workers.
    pub fn in_flight(&self) -> HashSet<String> {
        lock_set(&self.in_flight).clone()
    }

    /// Run the worker pool with the tracing reporter.
    pub async fn run(&self, options: RunOptions) -> Result<(), AppError> {
        self.run_with_reporter(options, &TracingStageReporter).await
    }

    /// Run `config.workers` workers until shutdown or a propagated error.
    ///
    /// Without a cancelled shutdown token this only returns on error: a
    /// storage failure while recording an outcome, or any attempt failure
    /// in fail-fast mode. The first error stops every worker of the stage.
    pub async fn run_with_reporter<R: StageReporter>(
        &self,
        options: RunOptions,
        reporter: &R,
    ) -> Result<(), AppError> {
        tracing::info!(
            stage = %self.config.name,
            version = self.config.version,
            workers = self.config.workers,
            fail_fast = options.fail_fast,
            "Stage running"
        );

        let workers = (0..self.config.workers).map(|worker| self.work(worker, &options, reporter));
        match try_join_all(workers).await {
            Ok(_) => {
                tracing::info!(stage = %self.config.name, "Stage stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(stage = %self.config.name, error = %e, "Stage halted");
                Err(e)
            }
        }
    }

    async fn work<R: StageReporter>(
        &self,
        worker: usize,
        options: &RunOptions,
        reporter: &R,
    ) -> Result<(), AppError> {
        let stage = self.config.name.as_str();
        reporter.report(StageEvent::Started { stage, worker });

        while let Some(claim) = self.next_job(worker, &options.shutdown, reporter).await {
            self.process(claim, options.fail_fast, reporter).await?;
        }

        reporter.report(StageEvent::Stopped { stage, worker });
        Ok(())
    }

    /// Block until a due job is claimed. `None` once shutdown is requested.
    async fn next_job<R: StageReporter>(
        &self,
        worker: usize,
        shutdown: &CancellationToken,
        reporter: &R,
    ) -> Option<Claim<'_>> {
        let signal = self.store.subscribe(&self.config.name);
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            // Register interest before querying so a flush that lands
            // between the query and the wait still wakes us.
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut backoff = self.idle_timeout;
            {
                let mut queue = self.queue.lock().await;
                loop {
                    if let Some(job) = queue.pop_front() {
                        if lock_set(&self.in_flight).insert(job.url.clone()) {
                            return Some(Claim {
                                job,
                                in_flight: &self.in_flight,
                            });
                        }
                        continue;
                    }

                    let in_flight = self.in_flight();
                    match self
                        .store
                        .query_due(&self.config.name, &self.policy, &in_flight)
                        .await
                    {
                        Ok(jobs) if !jobs.is_empty() => queue.extend(jobs),
                        Ok(_) => break,
                        Err(e) => {
                            tracing::error!(stage = %self.config.name, error = %e, "Failed to query due jobs");
                            backoff = self.idle_timeout.saturating_mul(2);
                            break;
                        }
                    }
                }
            }

            reporter.report(StageEvent::Idle {
                stage: &self.config.name,
                worker,
            });
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(backoff) => {}
                () = shutdown.cancelled() => return None,
            }
        }
    }

    async fn process<R: StageReporter>(
        &self,
        claim: Claim<'_>,
        fail_fast: bool,
        reporter: &R,
    ) -> Result<(), AppError> {
        let job = &claim.job;
        reporter.report(StageEvent::JobAcquired { job });

        let (record, result) = match self.attempt(job).await {
            Ok(()) => {
                let updated = job.succeeded(self.config.version, Utc::now());
                let result = self.store.report_outcome(&updated).await;
                if result.is_ok() {
                    reporter.report(StageEvent::JobSucceeded { job: &updated });
                }
                (updated, result)
            }
            Err(e) if fail_fast || !e.is_recordable() => {
                reporter.report(StageEvent::JobFailed {
                    job,
                    error: &e,
                    will_retry: false,
                });
                (job.clone(), Err(e))
            }
            Err(e) => {
                let updated = job.failed(self.config.version, e.to_string(), Utc::now());
                let result = self.store.report_outcome(&updated).await;
                if result.is_ok() {
                    reporter.report(StageEvent::JobFailed {
                        job: &updated,
                        error: &e,
                        will_retry: updated.is_due(&self.policy, updated.timestamp),
                    });
                }
                (updated, result)
            }
        };

        drop(claim);
        reporter.report(StageEvent::JobProcessed { job: &record });
        result
    }

    /// Download and run every processor on one job.
    async fn attempt(&self, job: &Job) -> Result<(), AppError> {
        let body = self
            .downloader
            .download(&job.url, &self.config.headers)
            .await?;
        for processor in &self.processors {
            processor
                .invoke(ProcessContext { job: job.clone() }, &body)
                .await?;
        }
        Ok(())
    }
}
