use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::traits::ContentCache;

/// Compute a SHA-256 hash of a cache key, returned as 64-char hex.
///
/// Persistent caches store this instead of the raw URL.
pub fn cache_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Upper bound on cached bytes (keys plus bodies).
    pub max_bytes: u64,
    pub time_to_live: Option<Duration>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            time_to_live: None,
        }
    }
}

/// In-memory content cache with size-bounded eviction and optional expiry.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, Arc<Vec<u8>>>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|key: &String, value: &Arc<Vec<u8>>| {
                u32::try_from(key.len() + value.len()).unwrap_or(u32::MAX)
            });
        if let Some(ttl) = config.time_to_live {
            builder = builder.time_to_live(ttl);
        }
        Self {
            inner: builder.build(),
        }
    }

    /// Approximate number of cached entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl ContentCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        Ok(self.inner.get(key).await.map(|bytes| bytes.as_ref().clone()))
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        self.inner
            .insert(key.to_string(), Arc::new(bytes.to_vec()))
            .await;
        Ok(())
    }
}
