//! Range queries, grouping, and reduce over an index's rows.

use rivetdb_core::collatable::{CollatableBuilder, CollatableReader, Tag};
use rivetdb_core::error::Result;
use rivetdb_core::varint;
use rivetdb_storage::{ContentOption, EnumerateBy, EnumeratorOptions, RecordEnumerator};
use tracing::debug;

use crate::Index;

/// One key range of a multi-range query. Keys are collatable-encoded.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub inclusive_end: bool,
}

impl KeyRange {
    pub fn single(key: Vec<u8>) -> KeyRange {
        KeyRange {
            start: key.clone(),
            end: key,
            inclusive_end: true,
        }
    }

    pub fn is_key_past_end(&self, key: &[u8]) -> bool {
        if self.inclusive_end {
            key > self.end.as_slice()
        } else {
            key >= self.end.as_slice()
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexEnumeratorOptions {
    pub descending: bool,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    pub skip: u64,
    pub limit: u64,
    /// Number of leading array elements to group on; 0 groups everything
    /// into a single reduced row (when a reducer is present).
    pub group_level: usize,
}

impl Default for IndexEnumeratorOptions {
    fn default() -> Self {
        IndexEnumeratorOptions {
            descending: false,
            inclusive_start: true,
            inclusive_end: true,
            skip: 0,
            limit: u64::MAX,
            group_level: 0,
        }
    }
}

/// Accumulates rows and produces one reduced value per group.
pub trait Reducer: Send {
    fn accumulate(&mut self, key: &[u8], value: &[u8]);
    /// Emits the reduced value and resets for the next group.
    fn finish(&mut self) -> Vec<u8>;
}

// Builds the underlying row-store bound for a query key: the row keys are
// arrays [key, docID, emit#], so the bound wraps the key (and optional
// docID) in an array, with a trailing dict placeholder as an "ellipsis"
// that outsorts any docID when the bound is an upper bound.
fn make_real_key(key: &[u8], doc_id: Option<&[u8]>, add_ellipsis: bool) -> Option<Vec<u8>> {
    if key.is_empty() {
        return None; // unbounded
    }
    let mut b = CollatableBuilder::new();
    b.begin_array();
    b.add_encoded(key);
    if let Some(doc_id) = doc_id {
        b.add_string(doc_id);
    }
    if add_ellipsis {
        b.begin_map();
        b.end_map();
    }
    b.end_array();
    Some(b.into_bytes())
}

// A decoded index row.
#[derive(Debug, Clone, Default)]
struct Row {
    key: Vec<u8>,
    value: Vec<u8>,
    doc_id: Vec<u8>,
    sequence: u64,
}

/// Cursor over matching index rows, ascending by (key, docID, emit#);
/// `descending` reverses. With a reducer, yields one row per group instead.
pub struct IndexEnumerator<'a> {
    index: &'a Index,
    options: IndexEnumeratorOptions,
    reducer: Option<Box<dyn Reducer>>,

    // Exact-key bounds for exclusive single-range queries.
    exclude_start_key: Option<Vec<u8>>,
    exclude_end_key: Option<Vec<u8>>,

    ranges: Vec<KeyRange>,
    current_range: usize,
    inner: Option<RecordEnumerator>,

    reducing: bool,
    grouped_prefix: Vec<u8>,

    skip: u64,
    limit: u64,
    row: Row,
}

impl<'a> IndexEnumerator<'a> {
    /// Query over one key range, optionally bounded by docID at each end.
    pub fn over_range(
        index: &'a Index,
        start_key: Vec<u8>,
        start_doc_id: Option<&[u8]>,
        end_key: Vec<u8>,
        end_doc_id: Option<&[u8]>,
        options: IndexEnumeratorOptions,
        reducer: Option<Box<dyn Reducer>>,
    ) -> Result<IndexEnumerator<'a>> {
        // In a descending query the caller's start is the high end.
        let (low_key, low_doc, high_key, high_doc) = if options.descending {
            (&end_key, end_doc_id, &start_key, start_doc_id)
        } else {
            (&start_key, start_doc_id, &end_key, end_doc_id)
        };
        let low = make_real_key(low_key, low_doc, false);
        let high = make_real_key(high_key, high_doc, true);

        let inner = Self::open_inner(index, low.as_deref(), high.as_deref(), options.descending)?;
        Ok(IndexEnumerator {
            index,
            exclude_start_key: (!options.inclusive_start).then(|| start_key.clone()),
            exclude_end_key: (!options.inclusive_end).then(|| end_key.clone()),
            skip: options.skip,
            limit: options.limit,
            options,
            reducer,
            ranges: Vec::new(),
            current_range: 0,
            inner: Some(inner),
            reducing: false,
            grouped_prefix: Vec::new(),
            row: Row::default(),
        })
    }

    /// Query over a list of key ranges (multi-key queries).
    pub fn over_ranges(
        index: &'a Index,
        ranges: Vec<KeyRange>,
        options: IndexEnumeratorOptions,
        reducer: Option<Box<dyn Reducer>>,
    ) -> Result<IndexEnumerator<'a>> {
        debug!(ranges = ranges.len(), "multi-range index query");
        let inner = match ranges.first() {
            Some(range) => Some(Self::open_range(index, range, options.descending)?),
            None => None,
        };
        Ok(IndexEnumerator {
            index,
            exclude_start_key: None,
            exclude_end_key: None,
            skip: options.skip,
            limit: options.limit,
            options,
            reducer,
            ranges,
            current_range: 0,
            inner,
            reducing: false,
            grouped_prefix: Vec::new(),
            row: Row::default(),
        })
    }

    fn open_range(
        index: &'a Index,
        range: &KeyRange,
        descending: bool,
    ) -> Result<RecordEnumerator> {
        let low = make_real_key(&range.start, None, false);
        let high = make_real_key(&range.end, None, true);
        Self::open_inner(index, low.as_deref(), high.as_deref(), descending)
    }

    fn open_inner(
        index: &'a Index,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        descending: bool,
    ) -> Result<RecordEnumerator> {
        let options = EnumeratorOptions {
            descending,
            include_deleted: true,
            content: ContentOption::EntireBody,
            ..EnumeratorOptions::default()
        };
        Ok(RecordEnumerator::new(index.store().new_enumerator(
            EnumerateBy::Key {
                start: low,
                end: high,
            },
            &options,
        )?))
    }

    // Advances to the next in-bounds physical row, switching key ranges as
    // they are exhausted. Skips the per-document lookup records, whose keys
    // are bare strings rather than arrays.
    fn advance_physical(&mut self) -> Result<Option<Row>> {
        loop {
            let Some(inner) = self.inner.as_mut() else {
                return Ok(None);
            };
            if !inner.next()? {
                if !self.ranges.is_empty() && self.current_range + 1 < self.ranges.len() {
                    self.current_range += 1;
                    let range = self.ranges[self.current_range].clone();
                    *inner = Self::open_range(self.index, &range, self.options.descending)?;
                    continue;
                }
                self.inner = None;
                return Ok(None);
            }

            let record = inner.record();
            if record.key.first() != Some(&(Tag::Array as u8)) {
                continue; // lookup record, not a row
            }
            let mut reader = CollatableReader::new(&record.key);
            reader.begin_array()?;
            let key = reader.read()?.to_vec();
            let doc_id = reader.read_string()?;
            let sequence = varint::get_uvarint(&record.version)
                .map(|(n, _)| n)
                .unwrap_or(0);
            let value = record.body().to_vec();

            // Exclusive single-range bounds match on the emitted key.
            if self.exclude_end_key.as_deref() == Some(key.as_slice()) {
                self.inner = None;
                return Ok(None);
            }
            if self.exclude_start_key.as_deref() == Some(key.as_slice()) {
                continue;
            }

            // Multi-range: hop to the next range once past this one's end.
            if !self.ranges.is_empty()
                && self.ranges[self.current_range].is_key_past_end(&key)
            {
                if self.current_range + 1 < self.ranges.len() {
                    self.current_range += 1;
                    let range = self.ranges[self.current_range].clone();
                    *self.inner.as_mut().unwrap() =
                        Self::open_range(self.index, &range, self.options.descending)?;
                    continue;
                }
                self.inner = None;
                return Ok(None);
            }

            return Ok(Some(Row {
                key,
                value,
                doc_id,
                sequence,
            }));
        }
    }

    // The encoded prefix of `key` covering its first `group_level` array
    // elements (or the whole key when it isn't an array or level is 0).
    fn grouped_prefix(&self, key: &[u8]) -> Vec<u8> {
        if self.options.group_level == 0 || key.first() != Some(&(Tag::Array as u8)) {
            return key.to_vec();
        }
        let mut reader = CollatableReader::new(&key[1..]);
        for _ in 0..self.options.group_level {
            if reader.next_tag() == Tag::EndSequence {
                break;
            }
            if reader.read().is_err() {
                return key.to_vec();
            }
        }
        let consumed = key.len() - 1 - reader.remaining().len();
        key[..1 + consumed].to_vec()
    }

    // The emitted key for a finished group. A grouped array prefix never
    // includes its outer terminator, so close it off; full-key groups are
    // already complete values.
    fn group_key(&self) -> Vec<u8> {
        let mut key = self.grouped_prefix.clone();
        if self.options.group_level > 0 && key.first() == Some(&(Tag::Array as u8)) {
            key.push(Tag::EndSequence as u8);
        }
        key
    }

    // Applies skip/limit to a candidate output row. Returns true to emit.
    fn admit(&mut self) -> Option<bool> {
        if self.skip > 0 {
            self.skip -= 1;
            return Some(false);
        }
        if self.limit == 0 {
            return None; // done entirely
        }
        self.limit -= 1;
        Some(true)
    }

    /// Advances to the next output row. With a reducer, output rows are one
    /// per group; otherwise one per index row.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            let physical = self.advance_physical()?;
            match physical {
                None => {
                    if self.reducing {
                        // Final group flush.
                        self.reducing = false;
                        let value = self.reducer.as_mut().unwrap().finish();
                        self.row = Row {
                            key: self.group_key(),
                            value,
                            doc_id: Vec::new(),
                            sequence: 0,
                        };
                        match self.admit() {
                            Some(true) => return Ok(true),
                            _ => return Ok(false),
                        }
                    }
                    return Ok(false);
                }
                Some(row) => {
                    if self.reducer.is_none() {
                        self.row = row;
                        match self.admit() {
                            Some(true) => return Ok(true),
                            Some(false) => continue,
                            None => {
                                self.inner = None;
                                return Ok(false);
                            }
                        }
                    }

                    let prefix = self.grouped_prefix(&row.key);
                    if !self.reducing {
                        self.reducing = true;
                        self.grouped_prefix = prefix;
                        self.reducer.as_mut().unwrap().accumulate(&row.key, &row.value);
                        continue;
                    }
                    let same_group = row.key.len() >= self.grouped_prefix.len()
                        && row.key[..self.grouped_prefix.len()] == self.grouped_prefix[..];
                    if same_group {
                        self.reducer.as_mut().unwrap().accumulate(&row.key, &row.value);
                        continue;
                    }
                    // Group changed: emit the finished group, then start the
                    // new one with this row.
                    let value = self.reducer.as_mut().unwrap().finish();
                    let finished_key = self.group_key();
                    self.grouped_prefix = prefix;
                    self.reducer.as_mut().unwrap().accumulate(&row.key, &row.value);
                    self.row = Row {
                        key: finished_key,
                        value,
                        doc_id: Vec::new(),
                        sequence: 0,
                    };
                    match self.admit() {
                        Some(true) => return Ok(true),
                        Some(false) => continue,
                        None => {
                            self.inner = None;
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    /// The current row's collatable-encoded key.
    pub fn key(&self) -> &[u8] {
        &self.row.key
    }

    /// The current row's key decoded to JSON.
    pub fn key_json(&self) -> Result<serde_json::Value> {
        CollatableReader::new(&self.row.key).read_json()
    }

    pub fn value(&self) -> &[u8] {
        &self.row.value
    }

    pub fn doc_id(&self) -> &[u8] {
        &self.row.doc_id
    }

    pub fn sequence(&self) -> u64 {
        self.row.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Index, IndexWriter};
    use rivetdb_core::collatable::encode_json;
    use rivetdb_storage::{DataFile, OpenOptions};
    use serde_json::json;

    fn open() -> (tempfile::TempDir, DataFile) {
        let dir = tempfile::tempdir().unwrap();
        let db = DataFile::open(dir.path().join("ixq.rivet"), &OpenOptions::default()).unwrap();
        (dir, db)
    }

    fn emit(index: &Index, db: &DataFile, doc_id: &[u8], seq: u64, pairs: &[(serde_json::Value, &str)]) {
        let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| encode_json(k)).collect();
        let values: Vec<Vec<u8>> = pairs.iter().map(|(_, v)| v.as_bytes().to_vec()).collect();
        let mut txn = db.begin_transaction().unwrap();
        IndexWriter::new(index, &mut txn)
            .update(doc_id, seq, &keys, &values)
            .unwrap();
        txn.commit().unwrap();
    }

    fn collect(e: &mut IndexEnumerator<'_>) -> Vec<(serde_json::Value, String, String)> {
        let mut rows = Vec::new();
        while e.next().unwrap() {
            rows.push((
                e.key_json().unwrap(),
                String::from_utf8(e.value().to_vec()).unwrap(),
                String::from_utf8(e.doc_id().to_vec()).unwrap(),
            ));
        }
        rows
    }

    fn fruit_index(db: &DataFile) -> Index {
        let index = Index::open(db, "fruit");
        emit(&index, db, b"doc1", 1, &[(json!("apple"), "1")]);
        emit(&index, db, b"doc2", 2, &[(json!("banana"), "2")]);
        emit(&index, db, b"doc3", 3, &[(json!("cherry"), "3")]);
        index
    }

    #[test]
    fn range_query_returns_matching_rows() {
        let (_dir, db) = open();
        let index = fruit_index(&db);

        // ["a".."b"): exactly the apple row.
        let mut e = IndexEnumerator::over_range(
            &index,
            encode_json(&json!("a")),
            None,
            encode_json(&json!("b")),
            None,
            IndexEnumeratorOptions::default(),
            None,
        )
        .unwrap();
        let rows = collect(&mut e);
        assert_eq!(rows, vec![(json!("apple"), "1".into(), "doc1".into())]);
    }

    #[test]
    fn full_range_ascending_and_descending() {
        let (_dir, db) = open();
        let index = fruit_index(&db);

        let mut e = IndexEnumerator::over_range(
            &index,
            Vec::new(),
            None,
            Vec::new(),
            None,
            IndexEnumeratorOptions::default(),
            None,
        )
        .unwrap();
        let keys: Vec<_> = collect(&mut e).into_iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![json!("apple"), json!("banana"), json!("cherry")]);

        let mut e = IndexEnumerator::over_range(
            &index,
            Vec::new(),
            None,
            Vec::new(),
            None,
            IndexEnumeratorOptions {
                descending: true,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let keys: Vec<_> = collect(&mut e).into_iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![json!("cherry"), json!("banana"), json!("apple")]);
    }

    #[test]
    fn skip_and_limit() {
        let (_dir, db) = open();
        let index = fruit_index(&db);
        let mut e = IndexEnumerator::over_range(
            &index,
            Vec::new(),
            None,
            Vec::new(),
            None,
            IndexEnumeratorOptions {
                skip: 1,
                limit: 1,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let rows = collect(&mut e);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, json!("banana"));
    }

    #[test]
    fn multi_range_query() {
        let (_dir, db) = open();
        let index = fruit_index(&db);
        let ranges = vec![
            KeyRange {
                start: encode_json(&json!("a")),
                end: encode_json(&json!("b")),
                inclusive_end: false,
            },
            KeyRange {
                start: encode_json(&json!("c")),
                end: encode_json(&json!("d")),
                inclusive_end: false,
            },
        ];
        let mut e = IndexEnumerator::over_ranges(
            &index,
            ranges,
            IndexEnumeratorOptions::default(),
            None,
        )
        .unwrap();
        let keys: Vec<_> = collect(&mut e).into_iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![json!("apple"), json!("cherry")]);
    }

    struct CountReducer {
        count: u64,
    }

    impl Reducer for CountReducer {
        fn accumulate(&mut self, _key: &[u8], _value: &[u8]) {
            self.count += 1;
        }
        fn finish(&mut self) -> Vec<u8> {
            let out = self.count.to_string().into_bytes();
            self.count = 0;
            out
        }
    }

    #[test]
    fn reduce_without_grouping_collapses_everything() {
        let (_dir, db) = open();
        let index = fruit_index(&db);
        let mut e = IndexEnumerator::over_range(
            &index,
            Vec::new(),
            None,
            Vec::new(),
            None,
            IndexEnumeratorOptions::default(),
            Some(Box::new(CountReducer { count: 0 })),
        )
        .unwrap();
        assert!(e.next().unwrap());
        assert_eq!(e.value(), b"3");
        assert!(!e.next().unwrap());
    }

    #[test]
    fn group_level_one_groups_by_first_element() {
        let (_dir, db) = open();
        let index = Index::open(&db, "grouped");
        // Array keys: [category, n].
        emit(&index, &db, b"d1", 1, &[(json!(["fruit", 1]), "1")]);
        emit(&index, &db, b"d2", 2, &[(json!(["fruit", 2]), "1")]);
        emit(&index, &db, b"d3", 3, &[(json!(["veg", 1]), "1")]);

        let mut e = IndexEnumerator::over_range(
            &index,
            Vec::new(),
            None,
            Vec::new(),
            None,
            IndexEnumeratorOptions {
                group_level: 1,
                ..Default::default()
            },
            Some(Box::new(CountReducer { count: 0 })),
        )
        .unwrap();

        let mut groups = Vec::new();
        while e.next().unwrap() {
            groups.push((
                e.key_json().unwrap(),
                String::from_utf8(e.value().to_vec()).unwrap(),
            ));
        }
        assert_eq!(
            groups,
            vec![
                (json!(["fruit"]), "2".to_string()),
                (json!(["veg"]), "1".to_string())
            ]
        );
    }

    #[test]
    fn rows_include_doc_id_and_sequence() {
        let (_dir, db) = open();
        let index = fruit_index(&db);
        let mut e = IndexEnumerator::over_range(
            &index,
            encode_json(&json!("banana")),
            None,
            encode_json(&json!("banana")),
            None,
            IndexEnumeratorOptions::default(),
            None,
        )
        .unwrap();
        assert!(e.next().unwrap());
        assert_eq!(e.doc_id(), b"doc2");
        assert_eq!(e.sequence(), 2);
        assert!(!e.next().unwrap());
    }
}
