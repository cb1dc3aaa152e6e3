//! Secondary indexing for RivetDB.
//!
//! An index is a key store of rows whose keys are collatable arrays
//! `[emitted key, docID, emit#]`, whose version metadata is the emitting
//! record's sequence (varint), and whose bodies are the emitted values.
//! [`IndexWriter::update`] reconciles the rows for one document against what
//! it emitted last time; [`enumerator::IndexEnumerator`] runs range queries,
//! grouping, and reduce over the rows.

pub mod enumerator;

use rivetdb_core::CollatableBuilder;
use rivetdb_core::error::{Result, RivetError};
use rivetdb_core::varint;
use rivetdb_storage::{
    Capabilities, ContentOption, DataFile, KeyStore, RedbKeyStore, Record, Transaction,
    index_store_name,
};
use tracing::{debug, warn};

pub use enumerator::{IndexEnumerator, IndexEnumeratorOptions, KeyRange, Reducer};

/// Placeholder emitted value meaning "the whole record"; always treated as
/// changed since the record body isn't hashed.
pub const SPECIAL_VALUE: &[u8] = b"*";

const INITIAL_HASH: u32 = 5381;

// djb2
fn add_hash(hash: &mut u32, bytes: &[u8]) {
    for &b in bytes {
        *hash = hash.wrapping_shl(5).wrapping_add(*hash).wrapping_add(u32::from(b));
    }
}

fn collatable_doc_id(doc_id: &[u8]) -> Vec<u8> {
    let mut b = CollatableBuilder::new();
    b.add_string(doc_id);
    b.into_bytes()
}

// Row key: [emitted key, docID, emit# (when > 0)].
fn real_key(key: &[u8], doc_id_collatable: &[u8], emit_index: usize) -> Vec<u8> {
    let mut b = CollatableBuilder::new();
    b.begin_array();
    b.add_encoded(key);
    b.add_encoded(doc_id_collatable);
    if emit_index > 0 {
        b.add_int(emit_index as i64);
    }
    b.end_array();
    b.into_bytes()
}

/// One secondary index: a named store of emitted rows.
pub struct Index {
    name: String,
    store: RedbKeyStore,
}

impl Index {
    pub fn open(db: &DataFile, name: &str) -> Index {
        Index {
            name: name.to_string(),
            store: db.key_store(&index_store_name(name), Capabilities::NO_SEQUENCES),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &dyn KeyStore {
        &self.store
    }

    /// Fetches one emitted row's value, by the exact emitted key.
    pub fn get_entry(
        &self,
        doc_id: &[u8],
        key: &[u8],
        emit_index: usize,
    ) -> Result<Option<Vec<u8>>> {
        let row_key = real_key(key, &collatable_doc_id(doc_id), emit_index);
        let rec = self.store.get(&row_key, ContentOption::EntireBody)?;
        Ok(rec.exists.then(|| rec.body().to_vec()))
    }
}

// ---------------------------------------------------------------------------
// IndexWriter
// ---------------------------------------------------------------------------

/// Applies one document's emitted `(key, value)` pairs to an index within a
/// transaction.
pub struct IndexWriter<'a, 'txn> {
    index: &'a Index,
    txn: &'a mut Transaction<'txn>,
}

// The per-document lookup record remembers what was emitted last time:
// varint value-hash, then each key as varint length + bytes.
fn encode_lookup(keys: &[Vec<u8>], hash: u32) -> Vec<u8> {
    let mut out = Vec::new();
    varint::put_uvarint(&mut out, u64::from(hash));
    for key in keys {
        varint::put_uvarint(&mut out, key.len() as u64);
        out.extend_from_slice(key);
    }
    out
}

fn decode_lookup(mut raw: &[u8]) -> Result<(Vec<Vec<u8>>, u32)> {
    let corrupt = || RivetError::CorruptIndexData("bad index lookup record".into());
    let hash = varint::read_uvarint(&mut raw).ok_or_else(corrupt)? as u32;
    let mut keys = Vec::new();
    while !raw.is_empty() {
        let len = varint::read_uvarint(&mut raw).ok_or_else(corrupt)? as usize;
        if len > raw.len() {
            return Err(corrupt());
        }
        keys.push(raw[..len].to_vec());
        raw = &raw[len..];
    }
    Ok((keys, hash))
}

impl<'a, 'txn> IndexWriter<'a, 'txn> {
    pub fn new(index: &'a Index, txn: &'a mut Transaction<'txn>) -> Self {
        IndexWriter { index, txn }
    }

    /// Replaces the document's emitted rows with `keys`/`values` (parallel
    /// lists; keys are collatable-encoded). Performs no I/O when the emitted
    /// keys and hashed values are unchanged. Returns true if any rows were
    /// written or deleted.
    pub fn update(
        &mut self,
        doc_id: &[u8],
        sequence: u64,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
    ) -> Result<bool> {
        debug_assert_eq!(keys.len(), values.len());
        let store = self.index.store();
        let doc_collatable = collatable_doc_id(doc_id);

        // Row metadata carries the emitting record's sequence.
        let mut meta = Vec::new();
        varint::put_uvarint(&mut meta, sequence);

        // What did this document emit last time?
        let (old_keys, old_hash) = {
            let mut lookup = Record::with_key(doc_collatable.clone());
            if store.read_in_txn(&mut lookup, ContentOption::EntireBody, self.txn)? {
                decode_lookup(lookup.body())?
            } else {
                (Vec::new(), INITIAL_HASH)
            }
        };

        // Hash the new values; if it matches, unchanged rows can be skipped.
        let mut new_hash = INITIAL_HASH;
        let mut force_changed = false;
        for value in values {
            if value.as_slice() == SPECIAL_VALUE {
                force_changed = true;
                break;
            }
            add_hash(&mut new_hash, value);
        }
        let values_might_be_unchanged = !force_changed && new_hash == old_hash;

        let mut keys_changed = false;
        let mut rows_added = 0u64;
        let mut rows_removed = 0u64;
        let mut old_pos = 0usize; // next positionally-matching old key
        let mut written_rows: Vec<Vec<u8>> = Vec::new();

        for (emit_index, (key, value)) in keys.iter().zip(values).enumerate() {
            let row_key = real_key(key, &doc_collatable, emit_index);

            if !keys_changed && old_keys.get(old_pos) == Some(key) {
                old_pos += 1;
                if values_might_be_unchanged {
                    let mut old_row = Record::with_key(row_key.clone());
                    if store.read_in_txn(&mut old_row, ContentOption::EntireBody, self.txn)? {
                        if old_row.body() == value.as_slice() {
                            continue; // identical row; no I/O
                        }
                    } else {
                        warn!(index = %self.index.name, "previously emitted row missing");
                    }
                }
                rows_removed += 1; // overwritten
            } else {
                keys_changed = true;
            }

            store.set_kv(&row_key, &meta, value, self.txn)?;
            written_rows.push(row_key);
            rows_added += 1;
        }

        // Delete rows for old keys no longer matched, keeping their original
        // emit positions; rows just rewritten under the same composite key
        // must survive.
        for (offset, old_key) in old_keys[old_pos..].iter().enumerate() {
            let row_key = real_key(old_key, &doc_collatable, old_pos + offset);
            keys_changed = true;
            if written_rows.contains(&row_key) {
                continue;
            }
            if !store.del(&row_key, self.txn, 0, None)? {
                warn!(index = %self.index.name, "stale index row already gone");
            }
            rows_removed += 1;
        }

        if keys_changed {
            if keys.is_empty() {
                store.del(&doc_collatable, self.txn, 0, None)?;
            } else {
                store.set_kv(&doc_collatable, &[], &encode_lookup(keys, new_hash), self.txn)?;
            }
        } else if rows_added > 0 && new_hash != old_hash {
            // Same keys, different values: refresh the stored hash.
            store.set_kv(&doc_collatable, &[], &encode_lookup(keys, new_hash), self.txn)?;
        }

        debug!(
            index = %self.index.name,
            added = rows_added,
            removed = rows_removed,
            "index update"
        );
        Ok(rows_added > 0 || rows_removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivetdb_core::collatable::encode_json;
    use rivetdb_storage::OpenOptions;
    use serde_json::json;

    fn open() -> (tempfile::TempDir, DataFile) {
        let dir = tempfile::tempdir().unwrap();
        let db = DataFile::open(dir.path().join("ix.rivet"), &OpenOptions::default()).unwrap();
        (dir, db)
    }

    fn emit(
        index: &Index,
        db: &DataFile,
        doc_id: &[u8],
        seq: u64,
        pairs: &[(serde_json::Value, &[u8])],
    ) -> bool {
        let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| encode_json(k)).collect();
        let values: Vec<Vec<u8>> = pairs.iter().map(|(_, v)| v.to_vec()).collect();
        let mut txn = db.begin_transaction().unwrap();
        let changed = IndexWriter::new(index, &mut txn)
            .update(doc_id, seq, &keys, &values)
            .unwrap();
        txn.commit().unwrap();
        changed
    }

    #[test]
    fn rows_are_written_and_read_back() {
        let (_dir, db) = open();
        let index = Index::open(&db, "by_fruit");
        let changed = emit(
            &index,
            &db,
            b"doc1",
            1,
            &[(json!("apple"), b"1"), (json!("banana"), b"2")],
        );
        assert!(changed);
        assert_eq!(
            index.get_entry(b"doc1", &encode_json(&json!("apple")), 0).unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(
            index.get_entry(b"doc1", &encode_json(&json!("banana")), 1).unwrap(),
            Some(b"2".to_vec())
        );
    }

    #[test]
    fn unchanged_emission_is_a_no_op() {
        let (_dir, db) = open();
        let index = Index::open(&db, "ix");
        let pairs = [(json!("k"), &b"v"[..])];
        assert!(emit(&index, &db, b"doc1", 1, &pairs));
        // Same keys and values again: no writes at all.
        assert!(!emit(&index, &db, b"doc1", 2, &pairs));
    }

    #[test]
    fn changed_value_rewrites_row() {
        let (_dir, db) = open();
        let index = Index::open(&db, "ix");
        assert!(emit(&index, &db, b"doc1", 1, &[(json!("k"), b"old")]));
        assert!(emit(&index, &db, b"doc1", 2, &[(json!("k"), b"new")]));
        assert_eq!(
            index.get_entry(b"doc1", &encode_json(&json!("k")), 0).unwrap(),
            Some(b"new".to_vec())
        );
        // And it settles: re-emitting is again a no-op.
        assert!(!emit(&index, &db, b"doc1", 3, &[(json!("k"), b"new")]));
    }

    #[test]
    fn dropped_keys_delete_rows() {
        let (_dir, db) = open();
        let index = Index::open(&db, "ix");
        emit(
            &index,
            &db,
            b"doc1",
            1,
            &[(json!("a"), b"1"), (json!("b"), b"2")],
        );
        emit(&index, &db, b"doc1", 2, &[(json!("a"), b"1")]);
        assert_eq!(
            index.get_entry(b"doc1", &encode_json(&json!("a")), 0).unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(
            index.get_entry(b"doc1", &encode_json(&json!("b")), 1).unwrap(),
            None
        );

        // Emitting nothing clears everything including the lookup record.
        assert!(emit(&index, &db, b"doc1", 3, &[]));
        assert_eq!(
            index.get_entry(b"doc1", &encode_json(&json!("a")), 0).unwrap(),
            None
        );
        assert!(!emit(&index, &db, b"doc1", 4, &[]));
    }

    #[test]
    fn special_value_always_rewrites() {
        let (_dir, db) = open();
        let index = Index::open(&db, "ix");
        let pairs = [(json!("k"), SPECIAL_VALUE)];
        assert!(emit(&index, &db, b"doc1", 1, &pairs));
        assert!(emit(&index, &db, b"doc1", 2, &pairs));
    }

    #[test]
    fn lookup_record_roundtrip() {
        let keys = vec![b"k1".to_vec(), b"key-two".to_vec()];
        let encoded = encode_lookup(&keys, 0xDEAD);
        let (back, hash) = decode_lookup(&encoded).unwrap();
        assert_eq!(back, keys);
        assert_eq!(hash, 0xDEAD);
        assert!(decode_lookup(&[]).is_err());
    }
}
