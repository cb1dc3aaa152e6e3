//! Basic document CRUD, MVCC conflicts, persistence across reopen.

use rivetdb::{Database, DatabaseOptions, EncryptionAlgorithm, GetOptions};
use rivetdb_core::error::RivetError;
use serde_json::json;

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("db"), DatabaseOptions::default()).unwrap()
}

#[test]
fn put_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let put = db.put("doc1", json!({"n": 1})).unwrap();
    assert!(put.rev.starts_with("1-"));
    assert_eq!(put.sequence, 1);

    let doc = db.get("doc1").unwrap();
    assert_eq!(doc.data, json!({"n": 1}));
    assert_eq!(doc.rev.as_deref(), Some(put.rev.as_str()));
    assert!(!doc.deleted);
    assert_eq!(doc.sequence, 1);
    assert_eq!(db.doc_count().unwrap(), 1);
    assert_eq!(db.last_sequence().unwrap(), 1);
}

#[test]
fn update_requires_current_rev() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let r1 = db.put("doc1", json!({"v": 1})).unwrap();

    // No rev on an existing doc: conflict.
    assert!(matches!(
        db.put("doc1", json!({"v": 2})),
        Err(RivetError::Conflict)
    ));
    // Wrong rev: conflict.
    assert!(matches!(
        db.update("doc1", "1-0000000000000000000000000000000000000000", json!({"v": 2})),
        Err(RivetError::Conflict)
    ));
    // Correct rev: succeeds with generation 2 and a new sequence.
    let r2 = db.update("doc1", &r1.rev, json!({"v": 2})).unwrap();
    assert!(r2.rev.starts_with("2-"));
    assert_eq!(r2.sequence, 2);
    assert_eq!(db.get("doc1").unwrap().data, json!({"v": 2}));
}

#[test]
fn delete_leaves_tombstone() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let r1 = db.put("doc1", json!({"v": 1})).unwrap();
    let r2 = db.delete("doc1", &r1.rev).unwrap();
    assert!(r2.rev.starts_with("2-"));

    assert!(matches!(db.get("doc1"), Err(RivetError::NotFound(_))));
    let tombstone = db
        .get_with_opts(
            "doc1",
            GetOptions {
                include_deleted: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(tombstone.deleted);
    assert_eq!(db.doc_count().unwrap(), 0);

    // Deleted docs can be recreated; history continues.
    let r3 = db.put("doc1", json!({"v": "back"})).unwrap();
    assert!(r3.rev.starts_with("3-"));
    assert_eq!(db.get("doc1").unwrap().data, json!({"v": "back"}));
}

#[test]
fn purge_removes_history() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("doc1", json!({"v": 1})).unwrap();
    assert!(db.purge("doc1").unwrap());
    assert!(!db.purge("doc1").unwrap());
    assert!(matches!(db.get("doc1"), Err(RivetError::NotFound(_))));

    // After a purge the doc can be created fresh at generation 1.
    let r = db.put("doc1", json!({"v": 2})).unwrap();
    assert!(r.rev.starts_with("1-"));
}

#[test]
fn get_specific_rev() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let r1 = db.put("doc1", json!({"v": 1})).unwrap();
    db.update("doc1", &r1.rev, json!({"v": 2})).unwrap();

    let old = db
        .get_with_opts(
            "doc1",
            GetOptions {
                rev: Some(r1.rev.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(old.data, json!({"v": 1}));
    assert_eq!(old.rev.as_deref(), Some(r1.rev.as_str()));

    assert!(
        db.get_with_opts(
            "doc1",
            GetOptions {
                rev: Some("9-ffff".into()),
                ..Default::default()
            }
        )
        .is_err()
    );
}

#[test]
fn changes_enumerate_in_sequence_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.put("a", json!({})).unwrap();
    db.put("b", json!({})).unwrap();
    let ra = db.get("a").unwrap().rev.unwrap();
    db.update("a", &ra, json!({"v": 2})).unwrap();

    let changes = db.changes_since(0, 100).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].id, "b");
    assert_eq!(changes[0].sequence, 2);
    assert_eq!(changes[1].id, "a");
    assert_eq!(changes[1].sequence, 3);
    assert!(changes[1].rev.starts_with("2-"));

    let later = db.changes_since(2, 100).unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].id, "a");
}

#[test]
fn data_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let uuid;
    {
        let db = open(&dir);
        db.put("doc1", json!({"stay": true})).unwrap();
        uuid = db.uuid().to_string();
    }
    let db = open(&dir);
    assert_eq!(db.uuid(), uuid);
    assert_eq!(db.get("doc1").unwrap().data, json!({"stay": true}));
    assert_eq!(db.last_sequence().unwrap(), 1);
}

#[test]
fn open_flags() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let err = Database::open(
        &missing,
        DatabaseOptions {
            create: false,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, RivetError::NotFound(_)));

    let err = Database::open(
        dir.path().join("enc"),
        DatabaseOptions {
            encryption: EncryptionAlgorithm::Aes256,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, RivetError::UnsupportedEncryption));
}

#[test]
fn blobs_roundtrip_through_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let digest = db.put_blob(b"attachment bytes").unwrap();
    assert_eq!(db.get_blob(&digest).unwrap(), b"attachment bytes");

    // Reference it from a document.
    db.put(
        "doc1",
        json!({
            "_attachments": {
                "file": {"content_type": "text/plain", "digest": digest, "length": 16, "stub": true}
            }
        }),
    )
    .unwrap();
    let doc = db.get("doc1").unwrap();
    let attachments = doc.attachments();
    assert_eq!(attachments["file"].length, 16);
}

#[test]
fn deep_edit_chains_are_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(
        dir.path().join("db"),
        DatabaseOptions {
            rev_tree_depth: 5,
            ..Default::default()
        },
    )
    .unwrap();

    let mut rev = db.put("doc1", json!({"i": 0})).unwrap().rev;
    for i in 1..20 {
        rev = db.update("doc1", &rev, json!({"i": i})).unwrap().rev;
    }
    // The oldest revisions are gone but the winner is intact.
    let doc = db.get("doc1").unwrap();
    assert_eq!(doc.data, json!({"i": 19}));
    assert!(
        db.get_with_opts(
            "doc1",
            GetOptions {
                rev: Some("1-".to_string() + &"0".repeat(40)),
                ..Default::default()
            }
        )
        .is_err()
    );
}
