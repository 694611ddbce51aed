use crate::error::AppError;
use crate::sync::ConcurrencyLimit;
use crate::traits::{ContentCache, FetchBackend, Headers, NoCache};

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Downloads allowed in flight at once, across every stage sharing the
    /// downloader.
    pub max_concurrent: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

/// Cache-first, concurrency-bounded downloads.
///
/// Clones share the cache and the concurrency limit.
#[derive(Clone)]
pub struct Downloader<F, C> {
    backend: F,
    cache: C,
    limit: ConcurrencyLimit,
}

impl<F: FetchBackend> Downloader<F, NoCache> {
    /// A downloader that always goes to the network.
    pub fn uncached(backend: F, config: DownloaderConfig) -> Self {
        Self::new(backend, NoCache, config)
    }
}

impl<F: FetchBackend, C: ContentCache> Downloader<F, C> {
    pub fn new(backend: F, cache: C, config: DownloaderConfig) -> Self {
        Self {
            backend,
            cache,
            limit: ConcurrencyLimit::new(config.max_concurrent),
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn limit(&self) -> &ConcurrencyLimit {
        &self.limit
    }

    /// Return cached bytes for `url`, or fetch them under the concurrency
    /// limit and cache them.
    ///
    /// Cache failures are logged and treated as misses; fetch failures are
    /// returned and leave the cache untouched.
    pub async fn download(&self, url: &str, headers: &Headers) -> Result<Vec<u8>, AppError> {
        match self.cache.get(url).await {
            Ok(Some(bytes)) => {
                tracing::debug!(%url, bytes = bytes.len(), "Cache hit");
                return Ok(bytes);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%url, error = %e, "Cache lookup failed"),
        }

        let _permit = self.limit.acquire().await?;
        tracing::debug!(%url, "Downloading");
        let bytes = self.backend.fetch(url, headers).await?;

        if let Err(e) = self.cache.set(url, &bytes).await {
            tracing::warn!(%url, error = %e, "Failed to cache download");
        }
        Ok(bytes)
    }
}
