use std::time::Duration;

use conveyor_core::error::AppError;
use conveyor_core::testutil::{MockFetchBackend, RecordingReporter};
use conveyor_core::traits::ContentCache;
use conveyor_core::{Downloader, DownloaderConfig, JobFilter, JobStore, Processor, RunOptions, Stage, StageConfig, StoreConfig};

use crate::common::setup_test_db;

#[tokio::test]
async fn stage_runs_against_postgres() {
    let (db, _container) = setup_test_db().await;
    let store = JobStore::new(db.job_backend(), StoreConfig::default());
    let fetch = MockFetchBackend::new("<html>page</html>");
    fetch.push_error(
        "http://x/flaky",
        AppError::HttpStatus {
            status: 502,
            url: "http://x/flaky".into(),
        },
    );
    let downloader = Downloader::new(fetch.clone(), db.content_cache(), DownloaderConfig::default());

    let stage = Stage::new(
        StageConfig::new("pages").with_workers(3),
        store.clone(),
        downloader.clone(),
    )
    .unwrap()
    .with_processor(Processor::text(|_, body| async move {
        if body.contains("page") {
            Ok(())
        } else {
            Err(AppError::processing("unexpected body"))
        }
    }));

    stage.add(["http://x/a", "http://x/b", "http://x/flaky"]);
    let reporter = RecordingReporter::new();
    tokio::select! {
        result = stage.run_with_reporter(RunOptions::default(), &reporter) => {
            panic!("stage stopped early: {result:?}")
        }
        processed = reporter.wait_for_processed(4) => assert_eq!(processed.len(), 4),
        () = tokio::time::sleep(Duration::from_secs(30)) => panic!("pipeline did not finish"),
    }

    let failed = store.list_jobs("pages", JobFilter::Failed, 10).await.unwrap();
    assert!(failed.is_empty());
    let flaky = store.get_job("pages", "http://x/flaky").await.unwrap().unwrap();
    assert_eq!(flaky.attempt, 1);

    // Only successful downloads are cached.
    assert!(downloader.cache().get("http://x/a").await.unwrap().is_some());
    assert!(downloader.cache().get("http://x/flaky").await.unwrap().is_some());
    assert_eq!(fetch.calls().len(), 4);

    store.close().await.unwrap();
}
