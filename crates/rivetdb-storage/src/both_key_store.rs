//! A composite key store backed by a *live* store and a *dead* (tombstone)
//! store, presenting them as one logical store.
//!
//! Deletions are routed to the dead store, everything else to the live one;
//! sequence numbers are allocated from the live store's counter and shared
//! with the dead store, so a delete-then-recreate cycle keeps sequences
//! strictly increasing across both. Enumeration merges the two underlying
//! enumerators, preferring the live entry on ties.

use rivetdb_core::error::{Result, RivetError};

use crate::data_file::Transaction;
use crate::enumerator::{EnumerateBy, EnumeratorImpl, EnumeratorOptions};
use crate::key_store::{Capabilities, IndexSpec, KeyStore};
use crate::record::{ContentOption, DocumentFlags, ReadBy, Record, RecordUpdate};

pub struct BothKeyStore {
    live: Box<dyn KeyStore>,
    dead: Box<dyn KeyStore>,
}

impl BothKeyStore {
    pub fn new(live: Box<dyn KeyStore>, dead: Box<dyn KeyStore>) -> Self {
        dead.share_sequences_with(live.as_ref());
        BothKeyStore { live, dead }
    }

    pub fn live(&self) -> &dyn KeyStore {
        self.live.as_ref()
    }

    pub fn dead(&self) -> &dyn KeyStore {
        self.dead.as_ref()
    }
}

impl KeyStore for BothKeyStore {
    fn name(&self) -> &str {
        self.live.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.live.capabilities()
    }

    fn sequence_owner(&self) -> String {
        self.live.sequence_owner()
    }

    fn share_sequences_with(&self, other: &dyn KeyStore) {
        self.live.share_sequences_with(other);
        self.dead.share_sequences_with(self.live.as_ref());
    }

    fn last_sequence(&self) -> Result<u64> {
        self.live.last_sequence()
    }

    fn record_count(&self, include_deleted: bool) -> Result<u64> {
        // The live store has no deleted records, so the cheap count is exact.
        let mut count = self.live.record_count(true)?;
        if include_deleted {
            count += self.dead.record_count(true)?;
        }
        Ok(count)
    }

    fn purge_count(&self) -> Result<u64> {
        Ok(self.live.purge_count()? + self.dead.purge_count()?)
    }

    fn read(&self, rec: &mut Record, by: ReadBy, content: ContentOption) -> Result<bool> {
        let probe = rec.clone();
        if self.live.read(rec, by, content)? {
            return Ok(true);
        }
        *rec = probe;
        self.dead.read(rec, by, content)
    }

    fn read_in_txn(
        &self,
        rec: &mut Record,
        content: ContentOption,
        txn: &Transaction<'_>,
    ) -> Result<bool> {
        let probe = rec.clone();
        if self.live.read_in_txn(rec, content, txn)? {
            return Ok(true);
        }
        *rec = probe;
        self.dead.read_in_txn(rec, content, txn)
    }

    fn set(
        &self,
        rec: &RecordUpdate<'_>,
        update_sequence: bool,
        txn: &mut Transaction<'_>,
    ) -> Result<u64> {
        let deleting = rec.flags.is_deleted();
        let (target, other) = if deleting {
            (self.dead.as_ref(), self.live.as_ref())
        } else {
            (self.live.as_ref(), self.dead.as_ref())
        };

        if update_sequence && rec.sequence == 0 {
            // Creation should fail if the doc exists in the *other* store.
            let mut probe = Record::with_key(rec.key);
            if other.read_in_txn(&mut probe, ContentOption::MetaOnly, txn)? {
                return Ok(0);
            }
        }

        let seq = target.set(rec, update_sequence, txn)?;

        if seq == 0 && rec.sequence > 0 {
            // Conflict. The record may live in the other store; if its
            // sequence matches there, delete it and retry as a creation.
            if other.del(rec.key, txn, rec.sequence, Some(rec.subsequence))? {
                let mut moved = *rec;
                moved.sequence = 0;
                moved.subsequence = 0;
                return target.set(&moved, update_sequence, txn);
            }
        }
        Ok(seq)
    }

    fn set_kv(
        &self,
        key: &[u8],
        version: &[u8],
        value: &[u8],
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        self.live.set_kv(key, version, value, txn)
    }

    fn del(
        &self,
        key: &[u8],
        txn: &mut Transaction<'_>,
        replacing_sequence: u64,
        replacing_subsequence: Option<u64>,
    ) -> Result<bool> {
        if self
            .live
            .del(key, txn, replacing_sequence, replacing_subsequence)?
        {
            Ok(true)
        } else {
            self.dead
                .del(key, txn, replacing_sequence, replacing_subsequence)
        }
    }

    fn set_document_flag(
        &self,
        key: &[u8],
        sequence: u64,
        flags: DocumentFlags,
        txn: &mut Transaction<'_>,
    ) -> Result<bool> {
        if self.live.set_document_flag(key, sequence, flags, txn)? {
            Ok(true)
        } else {
            self.dead.set_document_flag(key, sequence, flags, txn)
        }
    }

    fn move_to(
        &self,
        key: &[u8],
        dst: &dyn KeyStore,
        txn: &mut Transaction<'_>,
        new_key: Option<&[u8]>,
    ) -> Result<()> {
        let mut probe = Record::with_key(key);
        if self.live.read_in_txn(&mut probe, ContentOption::MetaOnly, txn)? {
            self.live.move_to(key, dst, txn, new_key)
        } else if self.dead.read_in_txn(&mut probe, ContentOption::MetaOnly, txn)? {
            self.dead.move_to(key, dst, txn, new_key)
        } else {
            Err(RivetError::NotFound(format!(
                "no record to move for key {key:02x?}"
            )))
        }
    }

    fn create_index(&self, spec: &IndexSpec, txn: &mut Transaction<'_>) -> Result<bool> {
        self.live.create_index(spec, txn)
    }

    fn delete_index(&self, name: &str, txn: &mut Transaction<'_>) -> Result<()> {
        self.live.delete_index(name, txn)
    }

    fn get_indexes(&self) -> Result<Vec<IndexSpec>> {
        self.live.get_indexes()
    }

    fn new_enumerator(
        &self,
        by: EnumerateBy<'_>,
        options: &EnumeratorOptions,
    ) -> Result<Box<dyn EnumeratorImpl>> {
        if !options.include_deleted {
            // Everything in the live store is non-deleted, so no merging or
            // filtering is needed.
            let mut live_options = *options;
            live_options.include_deleted = true;
            return self.live.new_enumerator(by, &live_options);
        }
        let live = self.live.new_enumerator(by, options)?;
        let dead = self.dead.new_enumerator(by, options)?;
        Ok(Box::new(BothEnumeratorImpl::new(
            live,
            dead,
            by.is_by_sequence(),
            options.descending,
        )))
    }
}

// ---------------------------------------------------------------------------
// Merge enumerator
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Live,
    Dead,
    Neither,
}

// Enumerates both stores in parallel, always yielding the lowest-sorting
// record next (a two-way merge sort).
struct BothEnumeratorImpl {
    live: Option<Box<dyn EnumeratorImpl>>,
    dead: Option<Box<dyn EnumeratorImpl>>,
    current: Side,
    cmp: i32,
    by_sequence: bool,
    descending: bool,
}

impl BothEnumeratorImpl {
    fn new(
        live: Box<dyn EnumeratorImpl>,
        dead: Box<dyn EnumeratorImpl>,
        by_sequence: bool,
        descending: bool,
    ) -> Self {
        BothEnumeratorImpl {
            live: Some(live),
            dead: Some(dead),
            current: Side::Neither,
            cmp: 0,
            by_sequence,
            descending,
        }
    }

    fn side(&self) -> Option<&dyn EnumeratorImpl> {
        match self.current {
            Side::Live => self.live.as_deref(),
            Side::Dead => self.dead.as_deref(),
            Side::Neither => None,
        }
    }
}

impl EnumeratorImpl for BothEnumeratorImpl {
    fn next(&mut self) -> bool {
        // Advance the side(s) that produced the previous record.
        if self.cmp <= 0 {
            if let Some(live) = &mut self.live {
                if !live.next() {
                    self.live = None;
                }
            }
        }
        if self.cmp >= 0 {
            if let Some(dead) = &mut self.dead {
                if !dead.next() {
                    self.dead = None;
                }
            }
        }

        self.cmp = match (&self.live, &self.dead) {
            (Some(live), Some(dead)) => {
                if self.by_sequence {
                    live.sequence().cmp(&dead.sequence()) as i32
                } else {
                    live.key().cmp(dead.key()) as i32
                }
            }
            (Some(_), None) => -1,
            (None, Some(_)) => 1,
            (None, None) => {
                self.current = Side::Neither;
                return false;
            }
        };
        if self.descending {
            self.cmp = -self.cmp;
        }

        // Lowest wins; ties go to the live store.
        self.current = if self.cmp <= 0 { Side::Live } else { Side::Dead };
        true
    }

    fn read(&self, rec: &mut Record) -> Result<bool> {
        match self.side() {
            Some(side) => side.read(rec),
            None => Ok(false),
        }
    }

    fn key(&self) -> &[u8] {
        self.side().map(|s| s.key()).unwrap_or(&[])
    }

    fn sequence(&self) -> u64 {
        self.side().map(|s| s.sequence()).unwrap_or(0)
    }
}
