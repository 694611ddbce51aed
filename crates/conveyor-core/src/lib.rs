pub mod cache;
pub mod downloader;
pub mod error;
pub mod job;
pub mod memory;
pub mod processor;
pub mod stage;
pub mod store;
pub mod sync;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{MemoryCache, MemoryCacheConfig, cache_key};
pub use downloader::{Downloader, DownloaderConfig};
pub use error::AppError;
pub use job::{DuePolicy, Job, JobFilter, StageConfig};
pub use memory::MemoryBackend;
pub use processor::{ProcessContext, Processor};
pub use stage::{RunOptions, Stage, StageEvent, StageReporter, TracingStageReporter};
pub use store::{JobStore, StageHandle, StoreConfig};
pub use sync::{ConcurrencyLimit, DebounceConfig, Debouncer};
pub use traits::{ContentCache, DueQuery, FetchBackend, Headers, InsertBatch, NoCache, StorageBackend};
