//! Document TTL: expiration metadata and expired-document purging.

use std::time::Duration;

use rivetdb::{Database, DatabaseOptions, now_ms};
use rivetdb_core::error::RivetError;
use serde_json::json;

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("db"), DatabaseOptions::default()).unwrap()
}

#[test]
fn set_and_get_expiration() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("doc1", json!({})).unwrap();
    db.put("doc2", json!({})).unwrap();

    assert_eq!(db.get_expiration("doc1").unwrap(), 0);
    db.set_expiration("doc1", 5000).unwrap();
    db.set_expiration("doc2", 1000).unwrap();
    assert_eq!(db.get_expiration("doc1").unwrap(), 5000);
    assert_eq!(db.next_expiration().unwrap(), 1000);

    // Zero clears it.
    db.set_expiration("doc2", 0).unwrap();
    assert_eq!(db.get_expiration("doc2").unwrap(), 0);
    assert_eq!(db.next_expiration().unwrap(), 5000);

    // Unknown docs can't be given an expiration.
    assert!(matches!(
        db.set_expiration("ghost", 1000),
        Err(RivetError::NotFound(_))
    ));
}

#[test]
fn purge_expired_removes_documents() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("old", json!({"v": 1})).unwrap();
    db.put("fresh", json!({"v": 2})).unwrap();
    db.set_expiration("old", 1000).unwrap();
    db.set_expiration("fresh", u64::from(u32::MAX) * 1000).unwrap();

    let purged = db.purge_expired(2000).unwrap();
    assert_eq!(purged, 1);
    assert!(db.get("old").is_err());
    assert_eq!(db.get("fresh").unwrap().data, json!({"v": 2}));
    assert_eq!(db.get_expiration("old").unwrap(), 0);

    // Nothing further to purge.
    assert_eq!(db.purge_expired(2000).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn ttl_sweeper_purges_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("doomed", json!({})).unwrap();
    db.set_expiration("doomed", now_ms().saturating_sub(10)).unwrap();

    let sweeper = db.start_ttl_sweeper(Duration::from_millis(50));
    let mut waited = Duration::ZERO;
    while db.get("doomed").is_ok() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert!(db.get("doomed").is_err(), "sweeper should purge expired doc");
    sweeper.stop();
}
