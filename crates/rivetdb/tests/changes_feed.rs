//! Live changes feed: backlog first, then committed changes as they happen.

use std::time::Duration;

use rivetdb::{Database, DatabaseOptions};
use serde_json::json;

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("db"), DatabaseOptions::default()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn backlog_then_live_events() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("existing", json!({"v": 1})).unwrap();

    let mut feed = db.live_changes(0).unwrap();
    let first = feed.next().await.unwrap();
    assert_eq!(first.id, "existing");
    assert_eq!(first.sequence, 1);
    assert!(!first.deleted);

    // New writes arrive while listening.
    let writer = db.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.put("new1", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.put("new2", json!({})).unwrap();
    });

    let second = tokio::time::timeout(Duration::from_secs(2), feed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, "new1");
    let third = tokio::time::timeout(Duration::from_secs(2), feed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.id, "new2");
}

#[tokio::test(flavor = "multi_thread")]
async fn since_skips_old_changes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("a", json!({})).unwrap();
    db.put("b", json!({})).unwrap();

    let mut feed = db.live_changes(1).unwrap();
    let event = feed.next().await.unwrap();
    assert_eq!(event.id, "b");
}

#[tokio::test(flavor = "multi_thread")]
async fn deletions_are_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let r = db.put("doc1", json!({})).unwrap();

    let mut feed = db.live_changes(0).unwrap();
    feed.next().await.unwrap();

    db.delete("doc1", &r.rev).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), feed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, "doc1");
    assert!(event.deleted);
    assert!(event.rev.starts_with("2-"));
}
