use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::traits::Headers;

/// One unit of work: a URL owned by a named stage.
///
/// `(stage, url)` is unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub url: String,
    pub stage: String,
    /// Stage version at the last attempt.
    pub version: u32,
    /// Consecutive attempts; 0 means never attempted, 1 after a success.
    pub attempt: u32,
    /// Last state change.
    pub timestamp: DateTime<Utc>,
    /// Last failure message, cleared on success.
    pub error: Option<String>,
}

impl Job {
    /// A freshly enqueued job that has never been attempted.
    pub fn new(
        stage: impl Into<String>,
        url: impl Into<String>,
        version: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            url: url.into(),
            stage: stage.into(),
            version,
            attempt: 0,
            timestamp: now,
            error: None,
        }
    }

    /// Whether the stage described by `policy` should (re)process this job.
    ///
    /// Does not account for in-flight URLs; that is the caller's concern.
    pub fn is_due(&self, policy: &DuePolicy, now: DateTime<Utc>) -> bool {
        if self.attempt == 0 {
            return true;
        }
        if self.error.is_some() && self.attempt < policy.max_attempts {
            return true;
        }
        if self.version != policy.version {
            return true;
        }
        match policy.stale_before(now) {
            Some(cutoff) => self.timestamp < cutoff,
            None => false,
        }
    }

    /// True once a failing job has used up its attempts.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.error.is_some() && self.attempt >= max_attempts
    }

    /// The record to write back after a successful attempt.
    pub fn succeeded(&self, version: u32, now: DateTime<Utc>) -> Job {
        Job {
            version,
            attempt: 1,
            timestamp: now,
            error: None,
            ..self.clone()
        }
    }

    /// The record to write back after a failed attempt. The error message
    /// always replaces the previous one.
    pub fn failed(&self, version: u32, error: impl Into<String>, now: DateTime<Utc>) -> Job {
        Job {
            version,
            attempt: self.attempt.saturating_add(1),
            timestamp: now,
            error: Some(error.into()),
            ..self.clone()
        }
    }
}

/// The parts of a stage's configuration that decide whether a job is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuePolicy {
    pub version: u32,
    pub max_attempts: u32,
    /// Minimum age of a successful job before it is re-crawled.
    /// `None` means never.
    pub retry_interval: Option<Duration>,
}

impl DuePolicy {
    /// Jobs last touched before this instant are due for a re-crawl.
    ///
    /// `None` when the stage never re-crawls, or when the interval reaches
    /// further back than representable time.
    pub fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = TimeDelta::from_std(self.retry_interval?).ok()?;
        now.checked_sub_signed(interval)
    }
}

/// Default number of attempts before a failing job stops being selected.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default number of parallel workers per stage.
pub const DEFAULT_WORKERS: usize = 10;

/// Immutable configuration of a processing stage.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub name: String,
    pub version: u32,
    pub retry_interval: Option<Duration>,
    pub max_attempts: u32,
    pub workers: usize,
    /// Extra request headers sent with every download of this stage.
    pub headers: Headers,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            retry_interval: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            workers: DEFAULT_WORKERS,
            headers: Headers::new(),
        }
    }

    /// Bumping the version makes every job of the stage due again.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigError("stage name must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(AppError::ConfigError(format!(
                "stage '{}' needs at least one worker",
                self.name
            )));
        }
        if self.max_attempts == 0 {
            return Err(AppError::ConfigError(format!(
                "stage '{}' max_attempts must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> DuePolicy {
        DuePolicy {
            version: self.version,
            max_attempts: self.max_attempts,
            retry_interval: self.retry_interval,
        }
    }
}

/// Selection for [`StorageBackend::list_jobs`](crate::traits::StorageBackend::list_jobs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    /// Jobs whose last attempt failed.
    Failed,
    /// Failed jobs with `attempt >= max_attempts`.
    Exhausted { max_attempts: u32 },
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::Failed => job.error.is_some(),
            JobFilter::Exhausted { max_attempts } => job.is_exhausted(*max_attempts),
        }
    }
}

impl fmt::Display for JobFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFilter::All => write!(f, "all"),
            JobFilter::Failed => write!(f, "failed"),
            JobFilter::Exhausted { max_attempts } => write!(f, "exhausted({max_attempts})"),
        }
    }
}

impl FromStr for JobFilter {
    type Err = String;

    /// Parses `all`, `failed`, or `exhausted` (with the default attempt limit).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(JobFilter::All),
            "failed" => Ok(JobFilter::Failed),
            "exhausted" => Ok(JobFilter::Exhausted {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            }),
            _ => Err(format!("Unknown job filter: {}", s)),
        }
    }
}
