//! Named key stores within a data file.
//!
//! `KeyStore` is the capability set every store implementation provides;
//! [`RedbKeyStore`] is the storage-engine-backed implementation, and
//! [`crate::both_key_store::BothKeyStore`] composes two of them.

use std::sync::Arc;

use parking_lot::RwLock;
use redb::ReadableTable;
use rivetdb_core::error::{Result, RivetError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_file::{DataFile, INDEXES, RECORDS, SEQUENCES, META, SharedFile, Transaction};
use crate::enumerator::{EnumerateBy, EnumeratorImpl, EnumeratorOptions, VecEnumeratorImpl};
use crate::record::{ContentOption, DocumentFlags, ReadBy, Record, RecordUpdate, decode_value, encode_value};

/// What a key store supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Records have sequences and can be enumerated by sequence.
    pub sequences: bool,
}

impl Capabilities {
    pub const WITH_SEQUENCES: Capabilities = Capabilities { sequences: true };
    pub const NO_SEQUENCES: Capabilities = Capabilities { sequences: false };
}

/// A registered secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// JSON property path (or expression) whose value is indexed.
    pub expression: String,
}

/// Name of the key store holding a secondary index's rows.
pub fn index_store_name(index_name: &str) -> String {
    format!("index::{index_name}")
}

// ---------------------------------------------------------------------------
// KeyStore capability set
// ---------------------------------------------------------------------------

pub trait KeyStore: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    /// The name whose sequence counter this store allocates from.
    fn sequence_owner(&self) -> String;
    /// Makes this store allocate sequences from `other`'s counter.
    fn share_sequences_with(&self, other: &dyn KeyStore);

    fn last_sequence(&self) -> Result<u64>;
    fn record_count(&self, include_deleted: bool) -> Result<u64>;
    fn purge_count(&self) -> Result<u64>;

    /// Fills in the rest of a record whose `key` (or `sequence`) is set.
    /// Returns false (and leaves `exists` false) if absent.
    fn read(&self, rec: &mut Record, by: ReadBy, content: ContentOption) -> Result<bool>;

    /// Like `read`, but sees uncommitted writes of the open transaction.
    fn read_in_txn(&self, rec: &mut Record, content: ContentOption, txn: &Transaction<'_>)
    -> Result<bool>;

    /// MVCC setter: `rec.sequence`/`rec.subsequence` must match the stored
    /// values (0/0 for a nonexistent record) or 0 is returned and nothing
    /// changes. On success returns the record's new sequence.
    fn set(
        &self,
        rec: &RecordUpdate<'_>,
        update_sequence: bool,
        txn: &mut Transaction<'_>,
    ) -> Result<u64>;

    /// Unconditional setter for stores without sequence semantics.
    fn set_kv(
        &self,
        key: &[u8],
        version: &[u8],
        value: &[u8],
        txn: &mut Transaction<'_>,
    ) -> Result<()>;

    /// Deletes a record. A nonzero `replacing_sequence` (and, if given,
    /// `replacing_subsequence`) must match the stored values or the delete
    /// fails, returning false.
    fn del(
        &self,
        key: &[u8],
        txn: &mut Transaction<'_>,
        replacing_sequence: u64,
        replacing_subsequence: Option<u64>,
    ) -> Result<bool>;

    /// Adds flag bits to a record without changing its sequence; only the
    /// subsequence is bumped. MVCC-checked against `sequence`.
    fn set_document_flag(
        &self,
        key: &[u8],
        sequence: u64,
        flags: DocumentFlags,
        txn: &mut Transaction<'_>,
    ) -> Result<bool>;

    /// Moves a record to another store (with a fresh sequence there),
    /// deleting it here, atomically within the transaction.
    fn move_to(
        &self,
        key: &[u8],
        dst: &dyn KeyStore,
        txn: &mut Transaction<'_>,
        new_key: Option<&[u8]>,
    ) -> Result<()>;

    fn create_index(&self, spec: &IndexSpec, txn: &mut Transaction<'_>) -> Result<bool>;
    fn delete_index(&self, name: &str, txn: &mut Transaction<'_>) -> Result<()>;
    fn get_indexes(&self) -> Result<Vec<IndexSpec>>;

    fn new_enumerator(
        &self,
        by: EnumerateBy<'_>,
        options: &EnumeratorOptions,
    ) -> Result<Box<dyn EnumeratorImpl>>;

    // Convenience lookups.

    fn get(&self, key: &[u8], content: ContentOption) -> Result<Record> {
        let mut rec = Record::with_key(key);
        self.read(&mut rec, ReadBy::Key, content)?;
        Ok(rec)
    }

    fn get_by_sequence(&self, sequence: u64, content: ContentOption) -> Result<Record> {
        let mut rec = Record::with_sequence(sequence);
        self.read(&mut rec, ReadBy::Sequence, content)?;
        Ok(rec)
    }
}

// ---------------------------------------------------------------------------
// RedbKeyStore
// ---------------------------------------------------------------------------

/// The storage-engine-backed key store.
pub struct RedbKeyStore {
    shared: Arc<SharedFile>,
    name: String,
    capabilities: Capabilities,
    seq_owner: RwLock<String>,
}

impl DataFile {
    /// Returns a handle to the named store, creating nothing until first
    /// write (stores are just key prefixes in the engine).
    pub fn key_store(&self, name: &str, capabilities: Capabilities) -> RedbKeyStore {
        RedbKeyStore {
            shared: self.shared().clone(),
            name: name.to_string(),
            capabilities,
            seq_owner: RwLock::new(name.to_string()),
        }
    }
}

impl RedbKeyStore {
    fn storage_err(e: impl std::fmt::Display) -> RivetError {
        RivetError::storage(e)
    }

    // Reads (sequence, subsequence, exists) through the write transaction.
    fn current_meta(&self, key: &[u8], txn: &Transaction<'_>) -> Result<(u64, u64, bool)> {
        let records = txn.wtx().open_table(RECORDS).map_err(Self::storage_err)?;
        match records
            .get((self.name.as_str(), key))
            .map_err(Self::storage_err)?
        {
            Some(guard) => {
                let rec = decode_value(key, guard.value(), ContentOption::MetaOnly)?;
                Ok((rec.sequence, rec.subsequence, true))
            }
            None => Ok((0, 0, false)),
        }
    }

    fn passes(rec: &Record, options: &EnumeratorOptions) -> bool {
        if !options.include_deleted && rec.flags.is_deleted() {
            return false;
        }
        if options.only_conflicts && !rec.flags.contains(DocumentFlags::CONFLICTED) {
            return false;
        }
        if options.only_blobs && !rec.flags.contains(DocumentFlags::HAS_ATTACHMENTS) {
            return false;
        }
        true
    }
}

impl KeyStore for RedbKeyStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn sequence_owner(&self) -> String {
        self.seq_owner.read().clone()
    }

    fn share_sequences_with(&self, other: &dyn KeyStore) {
        *self.seq_owner.write() = other.sequence_owner();
    }

    fn last_sequence(&self) -> Result<u64> {
        let rtx = self.shared.db.begin_read().map_err(Self::storage_err)?;
        let meta = rtx.open_table(META).map_err(Self::storage_err)?;
        let key = format!("seq:{}", self.sequence_owner());
        Ok(meta
            .get(key.as_str())
            .map_err(Self::storage_err)?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    fn record_count(&self, include_deleted: bool) -> Result<u64> {
        let rtx = self.shared.db.begin_read().map_err(Self::storage_err)?;
        let records = rtx.open_table(RECORDS).map_err(Self::storage_err)?;
        let mut count = 0;
        for item in records
            .range((self.name.as_str(), &[][..])..)
            .map_err(Self::storage_err)?
        {
            let (k, v) = item.map_err(Self::storage_err)?;
            let (store, key) = k.value();
            if store != self.name {
                break;
            }
            if !include_deleted {
                let rec = decode_value(key, v.value(), ContentOption::MetaOnly)?;
                if rec.flags.is_deleted() {
                    continue;
                }
            }
            count += 1;
        }
        Ok(count)
    }

    fn purge_count(&self) -> Result<u64> {
        let rtx = self.shared.db.begin_read().map_err(Self::storage_err)?;
        let meta = rtx.open_table(META).map_err(Self::storage_err)?;
        let key = format!("purge:{}", self.name);
        Ok(meta
            .get(key.as_str())
            .map_err(Self::storage_err)?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    fn read(&self, rec: &mut Record, by: ReadBy, content: ContentOption) -> Result<bool> {
        let rtx = self.shared.db.begin_read().map_err(Self::storage_err)?;
        let records = rtx.open_table(RECORDS).map_err(Self::storage_err)?;
        let key: Vec<u8> = match by {
            ReadBy::Key => rec.key.clone(),
            ReadBy::Sequence => {
                let seqs = rtx.open_table(SEQUENCES).map_err(Self::storage_err)?;
                match seqs
                    .get((self.name.as_str(), rec.sequence))
                    .map_err(Self::storage_err)?
                {
                    Some(guard) => guard.value().to_vec(),
                    None => {
                        rec.exists = false;
                        return Ok(false);
                    }
                }
            }
        };
        match records
            .get((self.name.as_str(), key.as_slice()))
            .map_err(Self::storage_err)?
        {
            Some(guard) => {
                *rec = decode_value(&key, guard.value(), content)?;
                Ok(true)
            }
            None => {
                rec.exists = false;
                Ok(false)
            }
        }
    }

    fn read_in_txn(
        &self,
        rec: &mut Record,
        content: ContentOption,
        txn: &Transaction<'_>,
    ) -> Result<bool> {
        let records = txn.wtx().open_table(RECORDS).map_err(Self::storage_err)?;
        let key = rec.key.clone();
        match records
            .get((self.name.as_str(), key.as_slice()))
            .map_err(Self::storage_err)?
        {
            Some(guard) => {
                *rec = decode_value(&key, guard.value(), content)?;
                Ok(true)
            }
            None => {
                rec.exists = false;
                Ok(false)
            }
        }
    }

    fn set(
        &self,
        rec: &RecordUpdate<'_>,
        update_sequence: bool,
        txn: &mut Transaction<'_>,
    ) -> Result<u64> {
        if !self.capabilities.sequences {
            return Err(RivetError::InvalidParameter(
                "store has no sequences; use set_kv".into(),
            ));
        }
        let (cur_seq, cur_subseq, existed) = self.current_meta(rec.key, txn)?;
        if rec.sequence != cur_seq || rec.subsequence != cur_subseq {
            debug!(
                store = %self.name,
                expected = rec.sequence,
                actual = cur_seq,
                "MVCC conflict on set"
            );
            return Ok(0);
        }
        let (new_seq, new_subseq) = if update_sequence {
            (txn.next_sequence(&self.sequence_owner())?, 0)
        } else {
            (cur_seq, cur_subseq + 1)
        };
        let value = encode_value(rec.flags, new_seq, new_subseq, rec.version, rec.body);
        {
            let mut records = txn.wtx().open_table(RECORDS).map_err(Self::storage_err)?;
            records
                .insert((self.name.as_str(), rec.key), value.as_slice())
                .map_err(Self::storage_err)?;
        }
        if update_sequence {
            let mut seqs = txn.wtx().open_table(SEQUENCES).map_err(Self::storage_err)?;
            if existed && cur_seq != 0 {
                seqs.remove((self.name.as_str(), cur_seq))
                    .map_err(Self::storage_err)?;
            }
            seqs.insert((self.name.as_str(), new_seq), rec.key)
                .map_err(Self::storage_err)?;
        }
        txn.record_change(&self.name, rec.key, new_seq, rec.flags);
        Ok(new_seq)
    }

    fn set_kv(
        &self,
        key: &[u8],
        version: &[u8],
        value: &[u8],
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        let encoded = encode_value(DocumentFlags::NONE, 0, 0, version, value);
        let mut records = txn.wtx().open_table(RECORDS).map_err(Self::storage_err)?;
        records
            .insert((self.name.as_str(), key), encoded.as_slice())
            .map_err(Self::storage_err)?;
        Ok(())
    }

    fn del(
        &self,
        key: &[u8],
        txn: &mut Transaction<'_>,
        replacing_sequence: u64,
        replacing_subsequence: Option<u64>,
    ) -> Result<bool> {
        let (cur_seq, cur_subseq, existed) = self.current_meta(key, txn)?;
        if !existed {
            return Ok(false);
        }
        if replacing_sequence != 0 {
            if cur_seq != replacing_sequence {
                return Ok(false);
            }
            if let Some(subseq) = replacing_subsequence {
                if cur_subseq != subseq {
                    return Ok(false);
                }
            }
        }
        {
            let mut records = txn.wtx().open_table(RECORDS).map_err(Self::storage_err)?;
            records
                .remove((self.name.as_str(), key))
                .map_err(Self::storage_err)?;
        }
        if self.capabilities.sequences && cur_seq != 0 {
            let mut seqs = txn.wtx().open_table(SEQUENCES).map_err(Self::storage_err)?;
            seqs.remove((self.name.as_str(), cur_seq))
                .map_err(Self::storage_err)?;
        }
        txn.bump_purge_count(&self.name)?;
        Ok(true)
    }

    fn set_document_flag(
        &self,
        key: &[u8],
        sequence: u64,
        flags: DocumentFlags,
        txn: &mut Transaction<'_>,
    ) -> Result<bool> {
        let mut rec = Record::with_key(key);
        if !self.read_in_txn(&mut rec, ContentOption::EntireBody, txn)? {
            return Ok(false);
        }
        if rec.sequence != sequence {
            return Ok(false);
        }
        let update = RecordUpdate {
            key,
            version: &rec.version,
            body: rec.body(),
            flags: rec.flags.with(flags),
            sequence: rec.sequence,
            subsequence: rec.subsequence,
        };
        Ok(self.set(&update, false, txn)? != 0 || rec.sequence == 0)
    }

    fn move_to(
        &self,
        key: &[u8],
        dst: &dyn KeyStore,
        txn: &mut Transaction<'_>,
        new_key: Option<&[u8]>,
    ) -> Result<()> {
        let mut rec = Record::with_key(key);
        if !self.read_in_txn(&mut rec, ContentOption::EntireBody, txn)? {
            return Err(RivetError::NotFound(format!(
                "no record to move for key {key:02x?}"
            )));
        }
        let dst_key = new_key.unwrap_or(key);
        let mut dst_rec = Record::with_key(dst_key);
        dst.read_in_txn(&mut dst_rec, ContentOption::MetaOnly, txn)?;
        let update = RecordUpdate {
            key: dst_key,
            version: &rec.version,
            body: rec.body(),
            flags: rec.flags,
            sequence: dst_rec.sequence,
            subsequence: dst_rec.subsequence,
        };
        if dst.set(&update, true, txn)? == 0 {
            return Err(RivetError::Conflict);
        }
        self.del(key, txn, 0, None)?;
        Ok(())
    }

    fn create_index(&self, spec: &IndexSpec, txn: &mut Transaction<'_>) -> Result<bool> {
        let encoded = serde_json::to_vec(spec)?;
        let mut indexes = txn.wtx().open_table(INDEXES).map_err(Self::storage_err)?;
        let existing = indexes
            .get((self.name.as_str(), spec.name.as_str()))
            .map_err(Self::storage_err)?
            .map(|g| g.value().to_vec());
        if existing.as_deref() == Some(encoded.as_slice()) {
            return Ok(false); // identical index already exists
        }
        indexes
            .insert((self.name.as_str(), spec.name.as_str()), encoded.as_slice())
            .map_err(Self::storage_err)?;
        Ok(true)
    }

    fn delete_index(&self, name: &str, txn: &mut Transaction<'_>) -> Result<()> {
        {
            let mut indexes = txn.wtx().open_table(INDEXES).map_err(Self::storage_err)?;
            indexes
                .remove((self.name.as_str(), name))
                .map_err(Self::storage_err)?;
        }
        txn.delete_all(&index_store_name(name))?;
        Ok(())
    }

    fn get_indexes(&self) -> Result<Vec<IndexSpec>> {
        let rtx = self.shared.db.begin_read().map_err(Self::storage_err)?;
        let indexes = rtx.open_table(INDEXES).map_err(Self::storage_err)?;
        let mut specs = Vec::new();
        for item in indexes
            .range((self.name.as_str(), "")..)
            .map_err(Self::storage_err)?
        {
            let (k, v) = item.map_err(Self::storage_err)?;
            let (store, _) = k.value();
            if store != self.name {
                break;
            }
            specs.push(serde_json::from_slice(v.value())?);
        }
        Ok(specs)
    }

    fn new_enumerator(
        &self,
        by: EnumerateBy<'_>,
        options: &EnumeratorOptions,
    ) -> Result<Box<dyn EnumeratorImpl>> {
        let rtx = self.shared.db.begin_read().map_err(Self::storage_err)?;
        let records = rtx.open_table(RECORDS).map_err(Self::storage_err)?;
        let mut snapshot = Vec::new();
        match by {
            EnumerateBy::Key { start, end } => {
                let from = start.unwrap_or(&[]);
                for item in records
                    .range((self.name.as_str(), from)..)
                    .map_err(Self::storage_err)?
                {
                    let (k, v) = item.map_err(Self::storage_err)?;
                    let (store, key) = k.value();
                    if store != self.name {
                        break;
                    }
                    if let Some(end) = end {
                        if key > end || (key == end && !options.inclusive_end) {
                            break;
                        }
                    }
                    if let Some(start) = start {
                        if key == start && !options.inclusive_start {
                            continue;
                        }
                    }
                    let rec = decode_value(key, v.value(), options.content)?;
                    if rec.sequence >= options.min_sequence && Self::passes(&rec, options) {
                        snapshot.push(rec);
                    }
                }
            }
            EnumerateBy::Sequence { since } => {
                let since = since.max(options.min_sequence.saturating_sub(1));
                let seqs = rtx.open_table(SEQUENCES).map_err(Self::storage_err)?;
                for item in seqs
                    .range((self.name.as_str(), since + 1)..)
                    .map_err(Self::storage_err)?
                {
                    let (k, v) = item.map_err(Self::storage_err)?;
                    let (store, _) = k.value();
                    if store != self.name {
                        break;
                    }
                    let key = v.value().to_vec();
                    if let Some(guard) = records
                        .get((self.name.as_str(), key.as_slice()))
                        .map_err(Self::storage_err)?
                    {
                        let rec = decode_value(&key, guard.value(), options.content)?;
                        if Self::passes(&rec, options) {
                            snapshot.push(rec);
                        }
                    }
                }
            }
        }
        if options.descending {
            snapshot.reverse();
        }
        Ok(Box::new(VecEnumeratorImpl::new(snapshot)))
    }
}
