//! The storage-layer unit: a keyed record with version metadata, body,
//! sequence numbers, and document flags.

use rivetdb_core::error::{Result, RivetError};
use rivetdb_core::varint;

// ---------------------------------------------------------------------------
// DocumentFlags
// ---------------------------------------------------------------------------

/// Per-record flag bits persisted with the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentFlags(u8);

impl DocumentFlags {
    pub const NONE: DocumentFlags = DocumentFlags(0);
    pub const DELETED: DocumentFlags = DocumentFlags(0x01);
    pub const CONFLICTED: DocumentFlags = DocumentFlags(0x02);
    pub const HAS_ATTACHMENTS: DocumentFlags = DocumentFlags(0x04);

    pub fn from_bits(bits: u8) -> DocumentFlags {
        DocumentFlags(bits & 0x07)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 | other.0)
    }

    pub fn without(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 & !other.0)
    }

    pub fn is_deleted(self) -> bool {
        self.contains(DocumentFlags::DELETED)
    }
}

/// How much of a record to materialize when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentOption {
    MetaOnly,
    #[default]
    EntireBody,
}

/// Lookup axis for [`crate::key_store::KeyStore::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBy {
    Key,
    Sequence,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// An in-memory record. `body` is `None` when the record was read
/// `MetaOnly`; `body_size` is valid either way.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub key: Vec<u8>,
    pub version: Vec<u8>,
    pub body: Option<Vec<u8>>,
    pub body_size: usize,
    pub sequence: u64,
    pub subsequence: u64,
    pub flags: DocumentFlags,
    pub exists: bool,
}

impl Record {
    pub fn with_key(key: impl Into<Vec<u8>>) -> Record {
        Record {
            key: key.into(),
            ..Record::default()
        }
    }

    pub fn with_sequence(sequence: u64) -> Record {
        Record {
            sequence,
            ..Record::default()
        }
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }
}

/// The properties of a record to save, including the sequence and
/// subsequence the caller believes are current (for the MVCC check).
#[derive(Debug, Clone, Copy)]
pub struct RecordUpdate<'a> {
    pub key: &'a [u8],
    pub version: &'a [u8],
    pub body: &'a [u8],
    pub flags: DocumentFlags,
    pub sequence: u64,
    pub subsequence: u64,
}

impl<'a> RecordUpdate<'a> {
    pub fn new(key: &'a [u8], body: &'a [u8]) -> Self {
        RecordUpdate {
            key,
            version: &[],
            body,
            flags: DocumentFlags::NONE,
            sequence: 0,
            subsequence: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk encoding
// ---------------------------------------------------------------------------

// Stored value layout: flags u8, sequence u64 BE, subsequence varint,
// version length varint, version bytes, body bytes.

pub(crate) fn encode_value(
    flags: DocumentFlags,
    sequence: u64,
    subsequence: u64,
    version: &[u8],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 2 + version.len() + body.len());
    out.push(flags.bits());
    out.extend_from_slice(&sequence.to_be_bytes());
    varint::put_uvarint(&mut out, subsequence);
    varint::put_uvarint(&mut out, version.len() as u64);
    out.extend_from_slice(version);
    out.extend_from_slice(body);
    out
}

pub(crate) fn decode_value(key: &[u8], raw: &[u8], content: ContentOption) -> Result<Record> {
    let corrupt = || RivetError::storage(format!("corrupt record value for key {key:02x?}"));
    if raw.len() < 9 {
        return Err(corrupt());
    }
    let flags = DocumentFlags::from_bits(raw[0]);
    let sequence = u64::from_be_bytes(raw[1..9].try_into().unwrap());
    let mut rest = &raw[9..];
    let subsequence = varint::read_uvarint(&mut rest).ok_or_else(corrupt)?;
    let version_len = varint::read_uvarint(&mut rest).ok_or_else(corrupt)? as usize;
    if version_len > rest.len() {
        return Err(corrupt());
    }
    let version = rest[..version_len].to_vec();
    let body = &rest[version_len..];
    Ok(Record {
        key: key.to_vec(),
        version,
        body: match content {
            ContentOption::EntireBody => Some(body.to_vec()),
            ContentOption::MetaOnly => None,
        },
        body_size: body.len(),
        sequence,
        subsequence,
        flags,
        exists: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_bit_operations() {
        let flags = DocumentFlags::DELETED.with(DocumentFlags::HAS_ATTACHMENTS);
        assert!(flags.contains(DocumentFlags::DELETED));
        assert!(flags.contains(DocumentFlags::HAS_ATTACHMENTS));
        assert!(!flags.contains(DocumentFlags::CONFLICTED));
        assert!(!flags.without(DocumentFlags::DELETED).is_deleted());
        assert_eq!(DocumentFlags::from_bits(0xFF).bits(), 0x07);
    }

    #[test]
    fn value_roundtrip() {
        let raw = encode_value(
            DocumentFlags::CONFLICTED,
            42,
            3,
            b"2-beef",
            b"{\"n\":1}",
        );
        let rec = decode_value(b"doc1", &raw, ContentOption::EntireBody).unwrap();
        assert_eq!(rec.key, b"doc1");
        assert_eq!(rec.version, b"2-beef");
        assert_eq!(rec.body(), b"{\"n\":1}");
        assert_eq!(rec.sequence, 42);
        assert_eq!(rec.subsequence, 3);
        assert_eq!(rec.flags, DocumentFlags::CONFLICTED);
        assert!(rec.exists);

        let meta = decode_value(b"doc1", &raw, ContentOption::MetaOnly).unwrap();
        assert!(meta.body.is_none());
        assert_eq!(meta.body_size, 7);
    }

    #[test]
    fn corrupt_value_rejected() {
        assert!(decode_value(b"k", &[1, 2, 3], ContentOption::EntireBody).is_err());
    }
}
