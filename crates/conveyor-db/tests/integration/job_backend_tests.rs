use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use conveyor_core::error::AppError;
use conveyor_core::job::{DuePolicy, Job, JobFilter};
use conveyor_core::traits::{DueQuery, InsertBatch, StorageBackend};
use conveyor_db::PgJobBackend;

use crate::common::setup_test_db;

fn batch(stage: &str, urls: &[&str]) -> InsertBatch {
    InsertBatch {
        stage: stage.to_string(),
        version: 1,
        urls: urls.iter().map(|u| u.to_string()).collect(),
    }
}

fn policy() -> DuePolicy {
    DuePolicy {
        version: 1,
        max_attempts: 3,
        retry_interval: None,
    }
}

async fn due(backend: &PgJobBackend, policy: &DuePolicy, in_flight: &HashSet<String>) -> Vec<Job> {
    backend
        .query_due(&DueQuery {
            stage: "items",
            policy,
            in_flight,
            limit: 20,
            now: Utc::now(),
        })
        .await
        .unwrap()
}

async fn fetch(backend: &PgJobBackend, url: &str) -> Job {
    backend
        .get_job("items", url)
        .await
        .unwrap()
        .expect("job should exist")
}

#[tokio::test]
async fn insert_batch_skips_existing_urls() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();

    let created = backend
        .insert_batch(&batch("items", &["http://x/1", "http://x/2"]))
        .await
        .unwrap();
    assert_eq!(created, 2);

    let mut done = fetch(&backend, "http://x/1").await;
    done = done.succeeded(1, Utc::now());
    backend.report_outcome(&done).await.unwrap();

    let created = backend
        .insert_batch(&batch("items", &["http://x/1", "http://x/3"]))
        .await
        .unwrap();
    assert_eq!(created, 1);

    // The re-added URL kept its processed state.
    let job = fetch(&backend, "http://x/1").await;
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn same_url_in_different_stages_is_distinct() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();

    backend.insert_batch(&batch("items", &["http://x/1"])).await.unwrap();
    backend.insert_batch(&batch("listing", &["http://x/1"])).await.unwrap();

    assert!(backend.get_job("items", "http://x/1").await.unwrap().is_some());
    assert!(backend.get_job("listing", "http://x/1").await.unwrap().is_some());
    assert!(backend.get_job("other", "http://x/1").await.unwrap().is_none());
}

#[tokio::test]
async fn query_due_follows_due_predicate() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();
    backend
        .insert_batch(&batch(
            "items",
            &["http://x/new", "http://x/ok", "http://x/retry", "http://x/dead", "http://x/old"],
        ))
        .await
        .unwrap();
    let now = Utc::now();

    let ok = fetch(&backend, "http://x/ok").await.succeeded(1, now);
    backend.report_outcome(&ok).await.unwrap();

    let retry = fetch(&backend, "http://x/retry").await.failed(1, "HTTP 500", now);
    backend.report_outcome(&retry).await.unwrap();

    let mut dead = fetch(&backend, "http://x/dead").await;
    for _ in 0..3 {
        dead = dead.failed(1, "HTTP 500", now);
    }
    backend.report_outcome(&dead).await.unwrap();

    let old = fetch(&backend, "http://x/old")
        .await
        .succeeded(1, now - TimeDelta::days(2));
    backend.report_outcome(&old).await.unwrap();

    let urls: HashSet<String> = due(&backend, &policy(), &HashSet::new())
        .await
        .into_iter()
        .map(|job| job.url)
        .collect();
    assert_eq!(
        urls,
        HashSet::from(["http://x/new".to_string(), "http://x/retry".to_string()])
    );

    let recrawl = DuePolicy {
        retry_interval: Some(Duration::from_secs(24 * 3600)),
        ..policy()
    };
    let urls: Vec<String> = due(&backend, &recrawl, &HashSet::new())
        .await
        .into_iter()
        .map(|job| job.url)
        .collect();
    // Oldest first: the two-day-old success sorts ahead of everything else.
    assert_eq!(urls[0], "http://x/old");
    assert_eq!(urls.len(), 3);

    let bumped = DuePolicy {
        version: 2,
        ..policy()
    };
    assert_eq!(due(&backend, &bumped, &HashSet::new()).await.len(), 5);
}

#[tokio::test]
async fn query_due_excludes_in_flight_and_respects_limit() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();
    let urls: Vec<String> = (0..30).map(|i| format!("http://x/{i:02}")).collect();
    backend
        .insert_batch(&InsertBatch {
            stage: "items".into(),
            version: 1,
            urls: urls.clone(),
        })
        .await
        .unwrap();

    let first = due(&backend, &policy(), &HashSet::new()).await;
    assert_eq!(first.len(), 20);

    let in_flight: HashSet<String> = first.iter().map(|job| job.url.clone()).collect();
    let rest = due(&backend, &policy(), &in_flight).await;
    assert_eq!(rest.len(), 10);
    assert!(rest.iter().all(|job| !in_flight.contains(&job.url)));
}

#[tokio::test]
async fn report_outcome_overwrites_row() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();
    backend.insert_batch(&batch("items", &["http://x/1"])).await.unwrap();

    let failed = fetch(&backend, "http://x/1").await.failed(1, "first", Utc::now());
    backend.report_outcome(&failed).await.unwrap();
    let failed = failed.failed(1, "second", Utc::now());
    backend.report_outcome(&failed).await.unwrap();

    let job = fetch(&backend, "http://x/1").await;
    assert_eq!(job.attempt, 2);
    assert_eq!(job.error.as_deref(), Some("second"));

    let done = job.succeeded(1, Utc::now());
    backend.report_outcome(&done).await.unwrap();
    let job = fetch(&backend, "http://x/1").await;
    assert_eq!(job.attempt, 1);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn report_outcome_for_missing_row_is_not_found() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();

    let ghost = Job::new("items", "http://x/ghost", 1, Utc::now());
    let err = backend.report_outcome(&ghost).await.unwrap_err();

    assert!(matches!(err, AppError::NotFound { .. }));
    assert!(!err.is_recordable());
}

#[tokio::test]
async fn list_jobs_filters_failures() {
    let (db, _container) = setup_test_db().await;
    let backend = db.job_backend();
    backend
        .insert_batch(&batch("items", &["http://x/ok", "http://x/flaky", "http://x/dead"]))
        .await
        .unwrap();
    let now = Utc::now();

    let flaky = fetch(&backend, "http://x/flaky").await.failed(1, "timeout", now);
    backend.report_outcome(&flaky).await.unwrap();
    let mut dead = fetch(&backend, "http://x/dead").await;
    for _ in 0..3 {
        dead = dead.failed(1, "HTTP 404", now);
    }
    backend.report_outcome(&dead).await.unwrap();

    let all = backend.list_jobs("items", JobFilter::All, 10).await.unwrap();
    assert_eq!(all.len(), 3);

    let failed = backend.list_jobs("items", JobFilter::Failed, 10).await.unwrap();
    assert_eq!(failed.len(), 2);

    let exhausted = backend
        .list_jobs("items", JobFilter::Exhausted { max_attempts: 3 }, 10)
        .await
        .unwrap();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].url, "http://x/dead");

    let limited = backend.list_jobs("items", JobFilter::All, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}
