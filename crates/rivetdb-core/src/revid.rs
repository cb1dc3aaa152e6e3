//! Revision identifier codec.
//!
//! A revision ID's ASCII form is `N-HEX`: a decimal generation number, a
//! hyphen, and a digest suffix. When the generation is small and the digest
//! is an even-length run of hex digits, the ID compacts to a binary form
//! `[gen_byte][digest bytes]`; the generation byte is biased past the ASCII
//! digit range so the two forms can be told apart by the first byte.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, RivetError};

/// Largest generation representable in the compact form.
const MAX_COMPACT_GENERATION: u32 = 245;

fn parse_digits(bytes: &[u8]) -> u32 {
    let mut result: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return 0;
        }
        result = 10 * result + u32::from(b - b'0');
    }
    result
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits an ASCII `N-HEX` revision ID into generation and digest.
///
/// The generation must be 1–8 decimal digits and nonzero; the digest must be
/// non-empty. Returns `None` for anything else.
pub fn parse(rev: &[u8]) -> Option<(u32, &[u8])> {
    let dash = rev.iter().position(|&b| b == b'-')?;
    if dash == 0 || dash > 8 || dash + 1 >= rev.len() {
        return None;
    }
    let generation = parse_digits(&rev[..dash]);
    if generation == 0 {
        return None;
    }
    Some((generation, &rev[dash + 1..]))
}

/// Splits a revision ID in either form into generation and digest bytes.
pub fn parse_compacted(rev: &[u8]) -> Option<(u32, &[u8])> {
    let first = *rev.first()?;
    if first.is_ascii_digit() {
        return parse(rev);
    }
    let mut generation = u32::from(first);
    if first > b'9' {
        generation -= 10;
    }
    Some((generation, &rev[1..]))
}

/// The generation number of a revision ID in either form, or 0 if malformed.
pub fn generation(rev: &[u8]) -> u32 {
    parse_compacted(rev).map(|(generation, _)| generation).unwrap_or(0)
}

/// Converts an ASCII revision ID to its compact binary form.
///
/// IDs whose generation exceeds 245 or whose digest is not an even-length
/// run of hex digits are copied through unchanged. Malformed IDs are an
/// error.
pub fn compact(rev: &[u8]) -> Result<Vec<u8>> {
    let (generation, digest) = parse(rev).ok_or_else(|| {
        RivetError::CorruptRevisionData(format!(
            "not a valid revision ID: {:?}",
            String::from_utf8_lossy(rev)
        ))
    })?;
    if generation > MAX_COMPACT_GENERATION || digest.len() % 2 != 0 {
        return Ok(rev.to_vec());
    }
    let mut binary = Vec::with_capacity(digest.len() / 2);
    for pair in digest.chunks(2) {
        match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => binary.push(16 * hi + lo),
            _ => return Ok(rev.to_vec()), // non-hex digest; copy uncompacted
        }
    }
    let mut encoded_gen = generation as u8;
    if encoded_gen >= b'0' {
        encoded_gen += 10; // skip the ASCII digit range
    }
    let mut out = Vec::with_capacity(1 + binary.len());
    out.push(encoded_gen);
    out.extend_from_slice(&binary);
    Ok(out)
}

/// Converts a compact revision ID back to ASCII form. Already-expanded IDs
/// are copied through unchanged.
pub fn expand(rev: &[u8]) -> Vec<u8> {
    let Some(&first) = rev.first() else {
        return Vec::new();
    };
    if first.is_ascii_digit() {
        return rev.to_vec();
    }
    let mut generation = u32::from(first);
    if first > b'9' {
        generation -= 10;
    }
    let mut out = format!("{generation}-").into_bytes();
    const HEX: &[u8] = b"0123456789abcdef";
    for &b in &rev[1..] {
        out.push(HEX[(b >> 4) as usize]);
        out.push(HEX[(b & 0x0f) as usize]);
    }
    out
}

/// Compares two revision IDs (in either form) by generation, then digest.
/// IDs that don't parse fall back to byte-lexicographic comparison.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    match (parse_compacted(a), parse_compacted(b)) {
        (Some((gen_a, dig_a)), Some((gen_b, dig_b))) => {
            gen_a.cmp(&gen_b).then_with(|| dig_a.cmp(dig_b))
        }
        _ => a.cmp(b),
    }
}

// ---------------------------------------------------------------------------
// RevId — an owned revision ID in compact form
// ---------------------------------------------------------------------------

/// An owned revision identifier, stored compacted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId(Vec<u8>);

impl RevId {
    /// Parses an ASCII `N-HEX` revision ID, storing it compacted.
    pub fn parse(ascii: &[u8]) -> Result<Self> {
        Ok(RevId(compact(ascii)?))
    }

    /// Wraps bytes that are already in compact (or passthrough) form.
    pub fn from_compacted(bytes: impl Into<Vec<u8>>) -> Self {
        RevId(bytes.into())
    }

    pub fn generation(&self) -> u32 {
        generation(&self.0)
    }

    pub fn digest(&self) -> &[u8] {
        parse_compacted(&self.0).map(|(_, digest)| digest).unwrap_or(&[])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn expanded(&self) -> String {
        String::from_utf8_lossy(&expand(&self.0)).into_owned()
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expanded())
    }
}

impl std::str::FromStr for RevId {
    type Err = RivetError;

    fn from_str(s: &str) -> Result<Self> {
        RevId::parse(s.as_bytes())
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ascii() {
        let (generation, digest) = parse(b"3-deadbeef").unwrap();
        assert_eq!(generation, 3);
        assert_eq!(digest, b"deadbeef");

        assert!(parse(b"nope").is_none());
        assert!(parse(b"-abc").is_none());
        assert!(parse(b"0-abc").is_none());
        assert!(parse(b"123456789-abc").is_none()); // > 8 digits
        assert!(parse(b"3-").is_none()); // empty digest
        assert!(parse(b"3x-abc").is_none());
    }

    #[test]
    fn compact_and_expand_roundtrip() {
        for id in [
            "1-aa",
            "3-deadbeef",
            "245-00ff",
            "17-cafebabe12345678",
        ] {
            let compacted = compact(id.as_bytes()).unwrap();
            assert!(compacted.len() < id.len(), "compaction should shrink {id}");
            assert_eq!(expand(&compacted), id.as_bytes());
        }
    }

    #[test]
    fn compaction_never_grows() {
        for id in ["1-aa", "246-abcd", "3-abc", "7-xyz!", "8-beef00"] {
            let compacted = compact(id.as_bytes()).unwrap();
            assert!(compacted.len() <= id.len());
            assert_eq!(expand(&compacted), id.as_bytes());
        }
    }

    #[test]
    fn passthrough_for_noncompactable() {
        // Odd-length digest stays ASCII.
        assert_eq!(compact(b"3-abc").unwrap(), b"3-abc");
        // Generation too large stays ASCII.
        assert_eq!(compact(b"246-abcd").unwrap(), b"246-abcd");
        // Non-hex digest stays ASCII.
        assert_eq!(compact(b"2-zzzz").unwrap(), b"2-zzzz");
    }

    #[test]
    fn generation_bias_skips_digit_range() {
        // Generations >= 0x30 would collide with ASCII digits without bias.
        let compacted = compact(b"72-beef").unwrap();
        assert_eq!(compacted[0], 82); // 72 + 10
        assert_eq!(generation(&compacted), 72);

        let small = compact(b"9-beef").unwrap();
        assert_eq!(small[0], 9);
        assert_eq!(generation(&small), 9);
    }

    #[test]
    fn ordering() {
        let a = RevId::parse(b"1-aa").unwrap();
        let b = RevId::parse(b"2-aa").unwrap();
        let c = RevId::parse(b"2-ab").unwrap();
        let d = RevId::parse(b"10-00").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(c < d); // numeric, not lexicographic, generation order
    }

    #[test]
    fn display_expands() {
        let id = RevId::parse(b"4-cafe").unwrap();
        assert_eq!(id.to_string(), "4-cafe");
        assert_eq!(id.generation(), 4);
        assert_eq!(id.digest(), &[0xca, 0xfe]);
    }
}
