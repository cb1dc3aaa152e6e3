//! Database-level replication: push/pull sync over a loopback transport,
//! conflicts from divergent edits, and attachment (blob) transfer.

use std::sync::Arc;
use std::time::Duration;

use rivetdb::{Activity, Database, DatabaseOptions, GetOptions, SingleUseConnector};
use rivetdb_blip::{Connection, Transport, loopback};
use rivetdb_replication::ReplicatorOptions;
use serde_json::json;

fn open(dir: &tempfile::TempDir, name: &str) -> Database {
    Database::open(dir.path().join(name), DatabaseOptions::default()).unwrap()
}

fn passive_peer(db: &Database) -> (impl Transport + use<>, Arc<Connection>) {
    let (active, passive) = loopback();
    let connection = Connection::start(passive, "listener");
    db.serve(&connection);
    (active, connection)
}

async fn sync(db: &Database, peer: &Database, options: ReplicatorOptions) {
    let (transport, _connection) = passive_peer(peer);
    let replicator = db.replicate(SingleUseConnector::new(transport), options);
    let status = tokio::time::timeout(Duration::from_secs(10), replicator.wait_stopped())
        .await
        .expect("replication should finish");
    assert_eq!(status.activity, Activity::Stopped);
    assert!(status.error.is_none(), "unexpected error: {:?}", status.error);
}

#[tokio::test(flavor = "multi_thread")]
async fn push_documents_to_peer() {
    let dir = tempfile::tempdir().unwrap();
    let local = open(&dir, "local");
    let remote = open(&dir, "remote");

    local.put("doc1", json!({"n": 1})).unwrap();
    local.put("doc2", json!({"n": 2})).unwrap();
    sync(&local, &remote, ReplicatorOptions::push_only("remote")).await;

    assert_eq!(remote.get("doc1").unwrap().data, json!({"n": 1}));
    assert_eq!(remote.get("doc2").unwrap().data, json!({"n": 2}));
    // Revisions carry over unchanged.
    assert_eq!(
        remote.get("doc1").unwrap().rev,
        local.get("doc1").unwrap().rev
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_sync() {
    let dir = tempfile::tempdir().unwrap();
    let local = open(&dir, "local");
    let remote = open(&dir, "remote");

    local.put("mine", json!({"from": "local"})).unwrap();
    remote.put("theirs", json!({"from": "remote"})).unwrap();
    sync(&local, &remote, ReplicatorOptions::push_and_pull("remote")).await;

    assert_eq!(local.get("theirs").unwrap().data, json!({"from": "remote"}));
    assert_eq!(remote.get("mine").unwrap().data, json!({"from": "local"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn divergent_edits_surface_as_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let local = open(&dir, "local");
    let remote = open(&dir, "remote");

    let base = local.put("doc1", json!({"v": "original"})).unwrap();
    sync(&local, &remote, ReplicatorOptions::push_only("remote")).await;

    local
        .update("doc1", &base.rev, json!({"v": "local edit"}))
        .unwrap();
    remote
        .update("doc1", &base.rev, json!({"v": "remote edit"}))
        .unwrap();
    sync(&local, &remote, ReplicatorOptions::push_and_pull("remote")).await;

    // Both sides hold both leaves and agree on the winner.
    let local_doc = local
        .get_with_opts(
            "doc1",
            GetOptions {
                conflicts: true,
                ..Default::default()
            },
        )
        .unwrap();
    let remote_doc = remote
        .get_with_opts(
            "doc1",
            GetOptions {
                conflicts: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(local_doc.rev, remote_doc.rev, "winner must be deterministic");
    assert!(local_doc.data.get("_conflicts").is_some());
    assert!(remote_doc.data.get("_conflicts").is_some());

    // Resolving by updating the winner clears the conflict after sync.
    let winner = local_doc.rev.unwrap();
    local
        .update("doc1", &winner, json!({"v": "resolved"}))
        .unwrap();
    sync(&local, &remote, ReplicatorOptions::push_and_pull("remote")).await;
    assert_eq!(remote.get("doc1").unwrap().data, json!({"v": "resolved"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn deletions_propagate() {
    let dir = tempfile::tempdir().unwrap();
    let local = open(&dir, "local");
    let remote = open(&dir, "remote");

    let r1 = local.put("doc1", json!({"v": 1})).unwrap();
    sync(&local, &remote, ReplicatorOptions::push_only("remote")).await;
    assert!(remote.get("doc1").is_ok());

    local.delete("doc1", &r1.rev).unwrap();
    sync(&local, &remote, ReplicatorOptions::push_only("remote")).await;
    assert!(remote.get("doc1").is_err());
    let tombstone = remote
        .get_with_opts(
            "doc1",
            GetOptions {
                include_deleted: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(tombstone.deleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn attachments_transfer_by_digest() {
    let dir = tempfile::tempdir().unwrap();
    let local = open(&dir, "local");
    let remote = open(&dir, "remote");

    let payload = vec![7u8; 10_000];
    let digest = local.put_blob(&payload).unwrap();
    local
        .put(
            "doc1",
            json!({
                "_attachments": {
                    "blob": {"content_type": "application/octet-stream",
                             "digest": digest, "length": 10_000, "stub": true}
                }
            }),
        )
        .unwrap();

    sync(&local, &remote, ReplicatorOptions::push_only("remote")).await;

    // The blob was fetched, verified, and installed on the peer.
    assert_eq!(remote.get_blob(&digest).unwrap(), payload);
    let doc = remote.get("doc1").unwrap();
    assert_eq!(doc.attachments()["blob"].digest, digest);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_sync_is_incremental() {
    let dir = tempfile::tempdir().unwrap();
    let local = open(&dir, "local");
    let remote = open(&dir, "remote");

    local.put("doc1", json!({"n": 1})).unwrap();
    let (transport, _c1) = passive_peer(&remote);
    let first = local.replicate(
        SingleUseConnector::new(transport),
        ReplicatorOptions::push_only("remote"),
    );
    assert_eq!(first.wait_stopped().await.documents_pushed, 1);

    local.put("doc2", json!({"n": 2})).unwrap();
    let (transport, _c2) = passive_peer(&remote);
    let second = local.replicate(
        SingleUseConnector::new(transport),
        ReplicatorOptions::push_only("remote"),
    );
    // Only the new document goes over the wire.
    assert_eq!(second.wait_stopped().await.documents_pushed, 1);
    assert!(remote.get("doc2").is_ok());
}
