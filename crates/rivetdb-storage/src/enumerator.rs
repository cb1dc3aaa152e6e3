//! Record enumeration over a key store, by key range or by sequence.

use rivetdb_core::error::Result;

use crate::record::{ContentOption, Record};

/// Which axis to enumerate, and from where.
#[derive(Debug, Clone, Copy)]
pub enum EnumerateBy<'a> {
    /// Ascending key order within `[start, end]` (bounds optional).
    Key {
        start: Option<&'a [u8]>,
        end: Option<&'a [u8]>,
    },
    /// Ascending sequence order, strictly after `since`.
    Sequence { since: u64 },
}

impl EnumerateBy<'_> {
    pub fn all_keys() -> Self {
        EnumerateBy::Key {
            start: None,
            end: None,
        }
    }

    pub fn is_by_sequence(&self) -> bool {
        matches!(self, EnumerateBy::Sequence { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnumeratorOptions {
    pub descending: bool,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    pub include_deleted: bool,
    pub only_conflicts: bool,
    pub only_blobs: bool,
    pub min_sequence: u64,
    pub content: ContentOption,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        EnumeratorOptions {
            descending: false,
            inclusive_start: true,
            inclusive_end: true,
            include_deleted: false,
            only_conflicts: false,
            only_blobs: false,
            min_sequence: 0,
            content: ContentOption::EntireBody,
        }
    }
}

/// The capability set an enumerator implementation must provide. The
/// composite store's merge enumerator wraps two of these.
pub trait EnumeratorImpl: Send {
    /// Advances to the next record; false at the end.
    fn next(&mut self) -> bool;
    /// Copies the current record into `rec`.
    fn read(&self, rec: &mut Record) -> Result<bool>;
    fn key(&self) -> &[u8];
    fn sequence(&self) -> u64;
}

/// Public cursor over records; wraps an implementation.
pub struct RecordEnumerator {
    inner: Option<Box<dyn EnumeratorImpl>>,
    current: Record,
}

impl RecordEnumerator {
    pub fn new(inner: Box<dyn EnumeratorImpl>) -> Self {
        RecordEnumerator {
            inner: Some(inner),
            current: Record::default(),
        }
    }

    /// Advances and materializes the next record; false at the end, after
    /// which the enumerator is closed.
    pub fn next(&mut self) -> Result<bool> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(false);
        };
        if !inner.next() {
            self.close();
            return Ok(false);
        }
        self.current = Record::default();
        self.inner.as_ref().unwrap().read(&mut self.current)?;
        Ok(true)
    }

    pub fn record(&self) -> &Record {
        &self.current
    }

    pub fn key(&self) -> &[u8] {
        &self.current.key
    }

    pub fn sequence(&self) -> u64 {
        self.current.sequence
    }

    pub fn close(&mut self) {
        self.inner = None;
        self.current = Record::default();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// Enumerator over an in-memory snapshot of records.
pub(crate) struct VecEnumeratorImpl {
    records: Vec<Record>,
    // Index of the current record + 1; 0 = before the first.
    pos: usize,
}

impl VecEnumeratorImpl {
    pub(crate) fn new(records: Vec<Record>) -> Self {
        VecEnumeratorImpl { records, pos: 0 }
    }

    fn current(&self) -> Option<&Record> {
        self.pos.checked_sub(1).and_then(|i| self.records.get(i))
    }
}

impl EnumeratorImpl for VecEnumeratorImpl {
    fn next(&mut self) -> bool {
        if self.pos < self.records.len() {
            self.pos += 1;
            true
        } else {
            self.pos = self.records.len() + 1;
            false
        }
    }

    fn read(&self, rec: &mut Record) -> Result<bool> {
        match self.current() {
            Some(current) => {
                *rec = current.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn key(&self) -> &[u8] {
        self.current().map(|r| r.key.as_slice()).unwrap_or(&[])
    }

    fn sequence(&self) -> u64 {
        self.current().map(|r| r.sequence).unwrap_or(0)
    }
}
