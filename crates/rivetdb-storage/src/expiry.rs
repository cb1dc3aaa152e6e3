//! Document expiration engine.
//!
//! Expiration state lives in a dedicated store holding one *pair* of
//! entries per expiring document: a time-keyed marker whose key is the
//! collatable array `[timestamp_ms, docID]` (empty body), and a reverse
//! index entry keyed by the raw docID whose body is the varint timestamp.
//! The marker keys sort by time, so "everything expired by now" is a prefix
//! scan; the reverse entries make updates and lookups by docID cheap.

use rivetdb_core::collatable::{CollatableBuilder, CollatableReader, Tag};
use rivetdb_core::error::Result;
use rivetdb_core::varint;
use tracing::debug;

use crate::data_file::Transaction;
use crate::enumerator::{EnumerateBy, EnumeratorOptions};
use crate::key_store::KeyStore;
use crate::record::{ContentOption, Record};

/// Milliseconds since the Unix epoch; 0 means "never expires".
pub type Timestamp = u64;

// Timestamps are clamped into i64 range for the collatable encoding.
fn clamp(timestamp: Timestamp) -> i64 {
    timestamp.min(i64::MAX as u64) as i64
}

fn time_key(timestamp: Timestamp, doc_id: &[u8]) -> Vec<u8> {
    let mut key = CollatableBuilder::new();
    key.begin_array();
    key.add_int(clamp(timestamp));
    key.add_string(doc_id);
    key.end_array();
    key.into_bytes()
}

// Sorts after every time-keyed entry with timestamp <= `end`: a dict
// placeholder outsorts any docID string.
fn end_key(end: Timestamp) -> Vec<u8> {
    let mut key = CollatableBuilder::new();
    key.begin_array();
    key.add_int(clamp(end));
    key.begin_map();
    key.end_map();
    key.end_array();
    key.into_bytes()
}

fn is_time_key(key: &[u8]) -> bool {
    key.first() == Some(&(Tag::Array as u8))
}

fn parse_time_key(key: &[u8]) -> Result<(Timestamp, Vec<u8>)> {
    let mut reader = CollatableReader::new(key);
    reader.begin_array()?;
    let timestamp = reader.read_int()? as Timestamp;
    let doc_id = reader.read_string()?;
    reader.end_array()?;
    Ok((timestamp, doc_id))
}

/// Sets (or clears, with 0) a document's expiration time.
pub fn set_expiration(
    expiry: &dyn KeyStore,
    doc_id: &[u8],
    timestamp: Timestamp,
    txn: &mut Transaction<'_>,
) -> Result<()> {
    let mut existing = Record::with_key(doc_id);
    if expiry.read_in_txn(&mut existing, ContentOption::EntireBody, txn)? {
        let old = varint::get_uvarint(existing.body()).map(|(n, _)| n).unwrap_or(0);
        if old == timestamp {
            return Ok(()); // no change
        }
        expiry.del(&time_key(old, doc_id), txn, 0, None)?;
    }
    if timestamp == 0 {
        expiry.del(doc_id, txn, 0, None)?;
    } else {
        expiry.set_kv(&time_key(timestamp, doc_id), &[], &[], txn)?;
        let mut value = Vec::new();
        varint::put_uvarint(&mut value, timestamp);
        expiry.set_kv(doc_id, &[], &value, txn)?;
    }
    Ok(())
}

/// A document's expiration time, or 0 if it doesn't expire.
pub fn get_expiration(expiry: &dyn KeyStore, doc_id: &[u8]) -> Result<Timestamp> {
    let rec = expiry.get(doc_id, ContentOption::EntireBody)?;
    if !rec.exists {
        return Ok(0);
    }
    Ok(varint::get_uvarint(rec.body()).map(|(n, _)| n).unwrap_or(0))
}

/// The nearest future time at which some document expires, or 0 if none.
pub fn next_expiration(expiry: &dyn KeyStore) -> Result<Timestamp> {
    let mut enumerator = ExpiryEnumerator::up_to(expiry, Timestamp::MAX)?;
    if enumerator.next() {
        Ok(enumerator.timestamp())
    } else {
        Ok(0)
    }
}

/// Enumerates time-keyed entries with timestamp <= the bound, yielding the
/// docIDs due for expiration.
pub struct ExpiryEnumerator {
    entries: Vec<(Vec<u8>, Timestamp, Vec<u8>)>, // (raw key, timestamp, docID)
    pos: usize,
}

impl ExpiryEnumerator {
    pub fn up_to(expiry: &dyn KeyStore, end: Timestamp) -> Result<ExpiryEnumerator> {
        let end_key = end_key(end);
        let options = EnumeratorOptions {
            include_deleted: true,
            ..EnumeratorOptions::default()
        };
        let mut inner = expiry.new_enumerator(
            EnumerateBy::Key {
                start: None,
                end: Some(&end_key),
            },
            &options,
        )?;
        let mut entries = Vec::new();
        while inner.next() {
            let key = inner.key().to_vec();
            if !is_time_key(&key) {
                continue; // reverse-index entry
            }
            let (timestamp, doc_id) = parse_time_key(&key)?;
            entries.push((key, timestamp, doc_id));
        }
        Ok(ExpiryEnumerator { entries, pos: 0 })
    }

    pub fn next(&mut self) -> bool {
        if self.pos < self.entries.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.entries[self.pos - 1].0
    }

    pub fn timestamp(&self) -> Timestamp {
        self.entries[self.pos - 1].1
    }

    pub fn doc_id(&self) -> &[u8] {
        &self.entries[self.pos - 1].2
    }
}

/// Deletes every document whose expiration time is <= `now`, along with
/// both halves of its expiry entry, inside the caller's transaction.
/// Returns the number of documents deleted.
pub fn purge_expired(
    expiry: &dyn KeyStore,
    target: &dyn KeyStore,
    now: Timestamp,
    txn: &mut Transaction<'_>,
    mut on_expired: impl FnMut(&[u8]),
) -> Result<usize> {
    let mut enumerator = ExpiryEnumerator::up_to(expiry, now)?;
    let mut purged = 0;
    while enumerator.next() {
        let doc_id = enumerator.doc_id().to_vec();
        expiry.del(enumerator.key(), txn, 0, None)?;
        expiry.del(&doc_id, txn, 0, None)?;
        if target.del(&doc_id, txn, 0, None)? {
            purged += 1;
            on_expired(&doc_id);
        }
    }
    debug!(purged, "expired documents purged");
    Ok(purged)
}
