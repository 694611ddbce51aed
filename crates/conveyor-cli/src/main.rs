use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use conveyor_client::{ReqwestFetcher, extract_links, same_host};
use conveyor_core::{
    ContentCache, Downloader, DownloaderConfig, JobFilter, JobStore, MemoryBackend, MemoryCache,
    MemoryCacheConfig, Processor, RunOptions, Stage, StageConfig, StorageBackend, StoreConfig,
};
use conveyor_db::{Database, DatabaseConfig};

const PAGES: &str = "pages";
const LINKS: &str = "links";

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Staged crawl pipelines with retries and re-crawls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a site: follow same-host links, check every outbound link
    Crawl(CrawlArgs),

    /// List jobs of a stage as JSON lines (requires DATABASE_URL)
    Jobs {
        /// Stage name (e.g. "pages", "links")
        #[arg(short, long, default_value = PAGES)]
        stage: String,

        /// One of: all, failed, exhausted
        #[arg(short, long, default_value = "all")]
        filter: JobFilter,

        /// Attempt limit used by the "exhausted" filter
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        /// Number of jobs to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Delete expired entries from the persistent content cache (requires DATABASE_URL)
    PurgeCache,
}

#[derive(Args)]
struct CrawlArgs {
    /// Start URL(s) of the crawl
    #[arg(short, long = "seed", required = true)]
    seeds: Vec<String>,

    /// Workers per stage
    #[arg(short, long, env = "CONVEYOR_WORKERS", default_value_t = 10)]
    workers: usize,

    /// Downloads in flight at once, across both stages
    #[arg(long, env = "CONVEYOR_MAX_CONCURRENT", default_value_t = 10)]
    max_concurrent: usize,

    /// Attempts before a failing URL is given up on
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Processing version; bump it to reprocess everything
    #[arg(long = "stage-version", default_value_t = 1)]
    stage_version: u32,

    /// Re-crawl successful pages older than this many seconds
    #[arg(long)]
    recrawl_secs: Option<u64>,

    /// Expire cached downloads after this many seconds
    #[arg(long)]
    cache_ttl_secs: Option<u64>,

    /// Stop after this many seconds (default: run until Ctrl+C)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Keep jobs in memory even if DATABASE_URL is set
    #[arg(long, default_value_t = false)]
    in_memory: bool,
}

impl CrawlArgs {
    fn stage(&self, name: &str) -> StageConfig {
        let config = StageConfig::new(name)
            .with_version(self.stage_version)
            .with_max_attempts(self.max_attempts)
            .with_workers(self.workers);
        match self.recrawl_secs {
            Some(secs) => config.with_retry_interval(Duration::from_secs(secs)),
            None => config,
        }
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("conveyor=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl(args) => cmd_crawl(args).await?,
        Commands::Jobs {
            stage,
            filter,
            max_attempts,
            limit,
        } => {
            let filter = match filter {
                JobFilter::Exhausted { .. } => JobFilter::Exhausted { max_attempts },
                other => other,
            };
            let db = connect_db().await?;
            cmd_jobs(&db, &stage, filter, limit).await?;
        }
        Commands::PurgeCache => {
            let db = connect_db().await?;
            let purged = db.content_cache().purge_expired().await?;
            println!("Purged {purged} expired cache entries");
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and ensure the schema exists.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    Database::open(&config)
        .await
        .context("Failed to open database")
}

async fn cmd_crawl(args: CrawlArgs) -> Result<()> {
    let fetcher = ReqwestFetcher::with_timeout(Duration::from_secs(args.timeout_secs))?;

    if !args.in_memory && std::env::var("DATABASE_URL").is_ok() {
        let db = connect_db().await?;
        let cache = match args.cache_ttl() {
            Some(ttl) => db.content_cache().with_ttl(ttl)?,
            None => db.content_cache(),
        };
        let purged = cache.purge_expired().await?;
        tracing::info!(purged, "Using PostgreSQL job store");
        let store = JobStore::new(db.job_backend(), StoreConfig::default());
        crawl(&args, store, fetcher, cache).await
    } else {
        tracing::info!("Using in-memory job store");
        let cache = MemoryCache::new(MemoryCacheConfig {
            time_to_live: args.cache_ttl(),
            ..MemoryCacheConfig::default()
        });
        let store = JobStore::new(MemoryBackend::new(), StoreConfig::default());
        crawl(&args, store, fetcher, cache).await
    }
}

/// Run the `pages` and `links` stages until shutdown.
///
/// `pages` parses HTML and feeds same-host links back into itself and
/// every other link into `links`, which only checks that it downloads.
async fn crawl<B, C>(
    args: &CrawlArgs,
    store: JobStore<B>,
    fetcher: ReqwestFetcher,
    cache: C,
) -> Result<()>
where
    B: StorageBackend,
    C: ContentCache,
{
    let downloader = Downloader::new(
        fetcher,
        cache,
        DownloaderConfig {
            max_concurrent: args.max_concurrent,
        },
    );

    let links = Stage::new(args.stage(LINKS), store.clone(), downloader.clone())?;
    let pages_handle = store.handle(PAGES, args.stage_version);
    let links_handle = links.handle();
    let pages = Stage::new(
        args.stage(PAGES).with_header("accept", "text/html"),
        store.clone(),
        downloader,
    )?
    .with_processor(Processor::text(move |ctx, html| {
        let (pages, links) = (pages_handle.clone(), links_handle.clone());
        async move {
            let found = extract_links(ctx.url(), &html);
            let (internal, external): (Vec<_>, Vec<_>) =
                found.into_iter().partition(|link| same_host(ctx.url(), link));
            tracing::debug!(
                url = %ctx.url(),
                internal = internal.len(),
                external = external.len(),
                "Links extracted"
            );
            pages.add(internal);
            links.add(external);
            Ok(())
        }
    }));

    let seeded = pages.add(args.seeds.iter().cloned());
    tracing::info!(seeded, "Crawl started");

    let shutdown = CancellationToken::new();
    tokio::spawn(stop_on_signal(shutdown.clone(), args.duration_secs));

    let options = RunOptions::default().with_shutdown(shutdown.clone());
    let outcome = tokio::try_join!(pages.run(options.clone()), links.run(options));
    shutdown.cancel();

    if outcome.is_ok() {
        for stage in [PAGES, LINKS] {
            match store.list_jobs(stage, JobFilter::Failed, usize::MAX).await {
                Ok(failed) => tracing::info!(%stage, failed = failed.len(), "Crawl finished"),
                Err(e) => tracing::warn!(%stage, error = %e, "Failed to count failed jobs"),
            }
        }
    }

    let closed = store.close().await;
    outcome.context("Crawl halted")?;
    closed.context("Failed to flush job store")?;
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or once the optional crawl duration elapses.
async fn stop_on_signal(shutdown: CancellationToken, after_secs: Option<u64>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let deadline = async {
        match after_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = ctrl_c => tracing::info!("Shutdown signal received"),
        () = deadline => tracing::info!("Crawl duration elapsed"),
        () = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

async fn cmd_jobs(db: &Database, stage: &str, filter: JobFilter, limit: usize) -> Result<()> {
    let jobs = db
        .job_backend()
        .list_jobs(stage, filter, limit)
        .await
        .context("Failed to list jobs")?;

    for job in &jobs {
        println!("{}", serde_json::to_string(job)?);
    }
    tracing::info!(%stage, %filter, count = jobs.len(), "Listed jobs");
    Ok(())
}
