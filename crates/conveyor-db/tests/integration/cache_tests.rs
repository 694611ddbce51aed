use std::time::Duration;

use conveyor_core::cache::cache_key;
use conveyor_core::traits::ContentCache;

use crate::common::setup_test_db;

#[tokio::test]
async fn set_then_get_round_trips_bytes() {
    let (db, _container) = setup_test_db().await;
    let cache = db.content_cache();

    assert_eq!(cache.get("http://x/1").await.unwrap(), None);
    cache.set("http://x/1", b"\x00binary\xff").await.unwrap();
    assert_eq!(
        cache.get("http://x/1").await.unwrap(),
        Some(b"\x00binary\xff".to_vec())
    );

    cache.set("http://x/1", b"replaced").await.unwrap();
    assert_eq!(cache.get("http://x/1").await.unwrap(), Some(b"replaced".to_vec()));
}

#[tokio::test]
async fn rows_are_keyed_by_url_hash() {
    let (db, _container) = setup_test_db().await;
    let cache = db.content_cache();
    cache.set("http://x/1", b"body").await.unwrap();

    let url: String = sqlx::query_scalar("SELECT url FROM content_cache WHERE cache_key = $1")
        .bind(cache_key("http://x/1"))
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(url, "http://x/1");
}

#[tokio::test]
async fn expired_entries_are_misses_until_purged() {
    let (db, _container) = setup_test_db().await;
    let cache = db
        .content_cache()
        .with_ttl(Duration::from_millis(200))
        .unwrap();
    let forever = db.content_cache();

    cache.set("http://x/short", b"soon gone").await.unwrap();
    forever.set("http://x/long", b"kept").await.unwrap();
    assert!(cache.get("http://x/short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(cache.get("http://x/short").await.unwrap(), None);
    assert_eq!(cache.purge_expired().await.unwrap(), 1);
    assert_eq!(forever.get("http://x/long").await.unwrap(), Some(b"kept".to_vec()));
    assert_eq!(cache.purge_expired().await.unwrap(), 0);
}
