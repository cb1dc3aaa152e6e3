//! Glue between revision trees and records: a document whose record body is
//! its encoded revision tree, whose version is the current revision ID, and
//! whose flags mirror the tree's state.

use rivetdb_core::error::Result;
use rivetdb_core::rev_tree::RevTree;

use crate::data_file::Transaction;
use crate::key_store::KeyStore;
use crate::record::{ContentOption, DocumentFlags, Record};
use crate::record::RecordUpdate;

pub struct VersionedDocument {
    doc_id: Vec<u8>,
    record: Record,
    tree: RevTree,
}

impl VersionedDocument {
    /// Loads a document (with its full revision tree) from the store.
    pub fn load(store: &dyn KeyStore, doc_id: &[u8]) -> Result<VersionedDocument> {
        let record = store.get(doc_id, ContentOption::EntireBody)?;
        Self::from_record(doc_id, record)
    }

    /// Like `load`, but sees the open transaction's uncommitted writes.
    pub fn load_in_txn(
        store: &dyn KeyStore,
        doc_id: &[u8],
        txn: &Transaction<'_>,
    ) -> Result<VersionedDocument> {
        let mut record = Record::with_key(doc_id);
        store.read_in_txn(&mut record, ContentOption::EntireBody, txn)?;
        Self::from_record(doc_id, record)
    }

    fn from_record(doc_id: &[u8], record: Record) -> Result<VersionedDocument> {
        let tree = if record.exists && record.body_size > 0 {
            RevTree::decode(record.body(), record.sequence)?
        } else {
            RevTree::new()
        };
        Ok(VersionedDocument {
            doc_id: doc_id.to_vec(),
            record,
            tree,
        })
    }

    pub fn doc_id(&self) -> &[u8] {
        &self.doc_id
    }

    pub fn exists(&self) -> bool {
        self.record.exists
    }

    pub fn sequence(&self) -> u64 {
        self.record.sequence
    }

    pub fn flags(&self) -> DocumentFlags {
        self.record.flags
    }

    pub fn tree(&self) -> &RevTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut RevTree {
        &mut self.tree
    }

    /// The current revision's compact ID, if any.
    pub fn current_rev_id(&self) -> Option<&[u8]> {
        self.tree.current().map(|node| node.rev_id.as_slice())
    }

    pub fn is_deleted(&self) -> bool {
        self.tree.current().is_some_and(|node| node.is_deleted())
    }

    pub fn is_conflicted(&self) -> bool {
        self.tree.has_conflict()
    }

    // Flags derived from the tree, plus caller-supplied extras (such as
    // HasAttachments, which requires interpreting revision bodies).
    fn computed_flags(&self, extra: DocumentFlags) -> DocumentFlags {
        let mut flags = extra;
        if self.is_deleted() {
            flags = flags.with(DocumentFlags::DELETED);
        }
        if self.is_conflicted() {
            flags = flags.with(DocumentFlags::CONFLICTED);
        }
        flags
    }

    /// Saves the document with MVCC semantics: returns 0 if the underlying
    /// record changed since this document was loaded, otherwise the new
    /// sequence. On success the in-memory state is marked saved.
    pub fn save(
        &mut self,
        store: &dyn KeyStore,
        extra_flags: DocumentFlags,
        txn: &mut Transaction<'_>,
    ) -> Result<u64> {
        self.tree.sort();
        let flags = self.computed_flags(extra_flags);
        let version = self
            .tree
            .current()
            .map(|node| node.rev_id.clone())
            .unwrap_or_default();
        let body = self.tree.encode();
        let update = RecordUpdate {
            key: &self.doc_id,
            version: &version,
            body: &body,
            flags,
            sequence: self.record.sequence,
            subsequence: self.record.subsequence,
        };
        let sequence = store.set(&update, true, txn)?;
        if sequence != 0 {
            self.tree.mark_saved(sequence);
            self.record.sequence = sequence;
            self.record.subsequence = 0;
            self.record.flags = flags;
            self.record.version = version;
            self.record.exists = true;
        }
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::both_key_store::BothKeyStore;
    use crate::data_file::{DataFile, OpenOptions};
    use crate::key_store::Capabilities;
    use rivetdb_core::revid;

    fn open() -> (tempfile::TempDir, DataFile) {
        let dir = tempfile::tempdir().unwrap();
        let db = DataFile::open(dir.path().join("vdoc.rivet"), &OpenOptions::default()).unwrap();
        (dir, db)
    }

    fn both(db: &DataFile) -> BothKeyStore {
        BothKeyStore::new(
            Box::new(db.key_store("docs", Capabilities::WITH_SEQUENCES)),
            Box::new(db.key_store("tombstones", Capabilities::WITH_SEQUENCES)),
        )
    }

    fn rev(ascii: &str) -> Vec<u8> {
        revid::compact(ascii.as_bytes()).unwrap()
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let (_dir, db) = open();
        let store = both(&db);

        let mut doc = VersionedDocument::load(&store, b"doc1").unwrap();
        assert!(!doc.exists());
        doc.tree_mut()
            .insert(rev("1-aa"), Some(b"{\"v\":1}".to_vec()), false, None, false)
            .unwrap();
        let mut txn = db.begin_transaction().unwrap();
        let seq = doc.save(&store, DocumentFlags::NONE, &mut txn).unwrap();
        txn.commit().unwrap();
        assert_eq!(seq, 1);

        let loaded = VersionedDocument::load(&store, b"doc1").unwrap();
        assert!(loaded.exists());
        assert_eq!(loaded.sequence(), 1);
        assert_eq!(loaded.current_rev_id(), Some(rev("1-aa").as_slice()));
        let node = loaded.tree().current().unwrap();
        assert_eq!(node.body.as_deref(), Some(&b"{\"v\":1}"[..]));
        assert_eq!(node.sequence, 1);
    }

    #[test]
    fn conflicted_flag_follows_tree() {
        let (_dir, db) = open();
        let store = both(&db);

        let mut doc = VersionedDocument::load(&store, b"doc1").unwrap();
        doc.tree_mut()
            .insert(rev("1-aa"), None, false, None, false)
            .unwrap();
        doc.tree_mut()
            .insert(rev("2-bb"), None, false, Some(&rev("1-aa")), false)
            .unwrap();
        doc.tree_mut()
            .insert(rev("2-cc"), None, false, Some(&rev("1-aa")), true)
            .unwrap();
        let mut txn = db.begin_transaction().unwrap();
        doc.save(&store, DocumentFlags::NONE, &mut txn).unwrap();
        txn.commit().unwrap();

        let loaded = VersionedDocument::load(&store, b"doc1").unwrap();
        assert!(loaded.flags().contains(DocumentFlags::CONFLICTED));
        assert!(loaded.is_conflicted());
    }

    #[test]
    fn deletion_routes_to_tombstone_store() {
        let (_dir, db) = open();
        let store = both(&db);

        let mut doc = VersionedDocument::load(&store, b"doc1").unwrap();
        doc.tree_mut()
            .insert(rev("1-aa"), None, false, None, false)
            .unwrap();
        let mut txn = db.begin_transaction().unwrap();
        doc.save(&store, DocumentFlags::NONE, &mut txn).unwrap();
        txn.commit().unwrap();

        doc.tree_mut()
            .insert(rev("2-bb"), None, true, Some(&rev("1-aa")), false)
            .unwrap();
        let mut txn = db.begin_transaction().unwrap();
        let seq = doc.save(&store, DocumentFlags::NONE, &mut txn).unwrap();
        txn.commit().unwrap();
        assert_eq!(seq, 2);

        assert!(!store.live().get(b"doc1", ContentOption::MetaOnly).unwrap().exists);
        let loaded = VersionedDocument::load(&store, b"doc1").unwrap();
        assert!(loaded.is_deleted());
        assert!(loaded.flags().is_deleted());
        // History survives deletion (tombstone keeps the tree).
        assert_eq!(loaded.tree().len(), 2);
    }

    #[test]
    fn stale_save_returns_conflict_sentinel() {
        let (_dir, db) = open();
        let store = both(&db);

        let mut doc_a = VersionedDocument::load(&store, b"doc1").unwrap();
        doc_a
            .tree_mut()
            .insert(rev("1-aa"), None, false, None, false)
            .unwrap();
        let mut doc_b = VersionedDocument::load(&store, b"doc1").unwrap();
        doc_b
            .tree_mut()
            .insert(rev("1-bb"), None, false, None, false)
            .unwrap();

        let mut txn = db.begin_transaction().unwrap();
        assert_ne!(doc_a.save(&store, DocumentFlags::NONE, &mut txn).unwrap(), 0);
        assert_eq!(doc_b.save(&store, DocumentFlags::NONE, &mut txn).unwrap(), 0);
        txn.commit().unwrap();
    }
}
