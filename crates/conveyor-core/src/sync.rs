//! Concurrency primitives shared by the store, the downloader and the stages.
//!
//! Critical sections use `tokio::sync::Mutex` directly; this module adds the
//! two pieces tokio does not ship as-is:
//!
//! - [`ConcurrencyLimit`]: a cloneable counting semaphore that bounds how many
//!   operations run at once.
//! - [`Debouncer`]: coalesces bursts of "dirty" signals into one flush after
//!   a quiet period, with a hard ceiling so continuous signalling still
//!   flushes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;

use crate::error::AppError;

/// At most `limit` holders at a time; further callers wait for a slot.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimit {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AppError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::ConfigError(format!("concurrency limit closed: {e}")))
    }

    /// Run `fut` while holding a slot.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, AppError> {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }
}

/// Longest pause between retries of a failing flush.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Timing of a [`Debouncer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Flush once no signal arrived for this long.
    pub quiet_period: Duration,
    /// Flush at the latest this long after the first signal of a burst.
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(100),
            max_wait: Duration::from_millis(200),
        }
    }
}

/// Timer-based coalescing of dirty signals into flush calls.
///
/// The flush action runs on a background task spawned at construction, so a
/// tokio runtime must be active. Dropping the debouncer runs one last flush
/// if a burst was still open, then ends the task.
///
/// The flush action reports whether it succeeded. A failed flush is retried
/// without waiting for a new signal, first after `max_wait` and then with
/// doubling delays up to [`MAX_RETRY_DELAY`].
#[derive(Debug)]
pub struct Debouncer {
    dirty: mpsc::Sender<()>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(config: DebounceConfig, flush: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        // One slot is enough: a queued signal already means "dirty".
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(run_debounce(config, rx, flush));
        Self { dirty: tx }
    }

    /// Mark pending work. Never blocks.
    pub fn trigger(&self) {
        // Full means a signal is already queued; closed means the task is gone.
        let _ = self.dirty.try_send(());
    }
}

async fn run_debounce<F, Fut>(config: DebounceConfig, mut rx: mpsc::Receiver<()>, flush: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    while rx.recv().await.is_some() {
        let deadline = Instant::now() + config.max_wait;
        let mut open =
            wait_until(&mut rx, || (Instant::now() + config.quiet_period).min(deadline)).await;

        let mut delay = config.max_wait.clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY);
        while !flush().await {
            if !open {
                return;
            }
            // Signals during the wait are folded into the retry.
            let retry_at = Instant::now() + delay;
            open = wait_until(&mut rx, || retry_at).await;
            delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
        }
    }
}

/// Swallow signals until the instant returned by `wake` (re-evaluated after
/// each signal). Returns `false` once the sender side is gone.
async fn wait_until(rx: &mut mpsc::Receiver<()>, wake: impl Fn() -> Instant) -> bool {
    loop {
        tokio::select! {
            signal = rx.recv() => {
                if signal.is_none() {
                    return false;
                }
            }
            () = tokio::time::sleep_until(wake()) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_debouncer(config: DebounceConfig) -> (Debouncer, Arc<Mutex<Vec<Instant>>>) {
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let recorded = flushes.clone();
        let debouncer = Debouncer::spawn(config, move || {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(Instant::now());
                true
            }
        });
        (debouncer, flushes)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_single_flush() {
        let (debouncer, flushes) = recording_debouncer(DebounceConfig::default());

        let start = Instant::now();
        for _ in 0..100 {
            debouncer.trigger();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        let waited = flushes[0] - start;
        assert!(waited >= Duration::from_millis(100), "flushed early: {waited:?}");
        assert!(waited <= Duration::from_millis(110), "flushed late: {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_resets_on_each_signal() {
        let (debouncer, flushes) = recording_debouncer(DebounceConfig {
            quiet_period: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
        });

        let start = Instant::now();
        for _ in 0..5 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        // Last signal at ~240ms, flush a quiet period later.
        assert!(flushes[0] - start >= Duration::from_millis(340));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_signals_flush_within_max_wait() {
        let (debouncer, flushes) = recording_debouncer(DebounceConfig::default());

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(1000) {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let flushes = flushes.lock().unwrap();
        assert!(flushes.len() >= 4, "only {} flushes", flushes.len());
        let first = flushes[0] - start;
        assert!(
            first <= Duration::from_millis(220),
            "first flush after {first:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drop_flushes_open_burst() {
        let (debouncer, flushes) = recording_debouncer(DebounceConfig {
            quiet_period: Duration::from_secs(60),
            max_wait: Duration::from_secs(60),
        });

        debouncer.trigger();
        tokio::task::yield_now().await;
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(flushes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_is_retried_without_new_signal() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let recorded = attempts.clone();
        let debouncer = Debouncer::spawn(DebounceConfig::default(), move || {
            let recorded = recorded.clone();
            async move {
                let mut attempts = recorded.lock().unwrap();
                attempts.push(Instant::now());
                // The first two flushes fail.
                attempts.len() > 2
            }
        });

        let start = Instant::now();
        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        // Quiet period, then retries after 200ms and 400ms.
        let gaps = [
            attempts[0] - start,
            attempts[1] - attempts[0],
            attempts[2] - attempts[1],
        ];
        for (gap, expected) in gaps.into_iter().zip([100, 200, 400]) {
            let expected = Duration::from_millis(expected);
            assert!(
                gap >= expected && gap <= expected + Duration::from_millis(10),
                "gap {gap:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_flush_stops_after_drop() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let debouncer = Debouncer::spawn(DebounceConfig::default(), move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                false
            }
        });

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(debouncer);
        tokio::time::sleep(Duration::from_secs(120)).await;

        // The first flush, then one last attempt once the sender is gone.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_active_holders() {
        let limit = ConcurrencyLimit::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let limit = limit.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    limit
                        .run(async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limit.available(), 3);
    }

    #[test]
    fn zero_limit_is_one() {
        assert_eq!(ConcurrencyLimit::new(0).limit(), 1);
    }
}
