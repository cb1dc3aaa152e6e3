//! Version vectors: ordered lists of `(author, generation)` pairs used for
//! causal ordering between peers.
//!
//! The string form is comma-delimited, most recent writer first:
//! `"3@alice,1@$"`. The reserved author `"*"` means the local peer (before
//! export) and `"$"` a CAS server. A merge version is written `"^<base64>"`
//! where the payload is a digest of the merged state; its generation is 0.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::error::{Result, RivetError};

/// Author of the local peer before a vector is exported.
pub const ME: &str = "*";
/// Author representing a CAS server.
pub const CAS_SERVER: &str = "$";

const MAX_AUTHOR_SIZE: usize = 64;

fn bad(what: impl Into<String>) -> RivetError {
    RivetError::BadVersionVector(what.into())
}

/// Result of comparing two vectors (or a vector and a version).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VersionOrder {
    Same = 0,
    Older = 1,
    Newer = 2,
    Conflicting = 3,
}

impl VersionOrder {
    fn from_bits(bits: u8) -> VersionOrder {
        match bits {
            0 => VersionOrder::Same,
            1 => VersionOrder::Older,
            2 => VersionOrder::Newer,
            _ => VersionOrder::Conflicting,
        }
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// A single `(generation, author)` pair. A merge version has generation 0
/// and a base64 digest for its author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    r#gen: u64,
    author: String,
}

impl Version {
    pub fn new(r#gen: u64, author: impl Into<String>) -> Result<Self> {
        let v = Version {
            r#gen,
            author: author.into(),
        };
        v.validate()?;
        Ok(v)
    }

    /// Parses `"gen@author"` or `"^base64"`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(digest) = s.strip_prefix('^') {
            let v = Version {
                r#gen: 0,
                author: digest.to_string(),
            };
            v.validate()?;
            return Ok(v);
        }
        let (gen_str, author) = s.split_once('@').ok_or_else(|| bad(s))?;
        let r#gen: u64 = gen_str.parse().map_err(|_| bad(s))?;
        if r#gen == 0 {
            return Err(bad(s));
        }
        let v = Version {
            r#gen,
            author: author.to_string(),
        };
        v.validate()?;
        Ok(v)
    }

    fn validate(&self) -> Result<()> {
        if self.author.is_empty() || self.author.len() > MAX_AUTHOR_SIZE {
            return Err(bad(format!("bad author size in {self}")));
        }
        if self.is_merge() {
            // Merge author must be valid base64.
            if !self
                .author
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'+' || c == b'/' || c == b'=')
            {
                return Err(bad(format!("bad merge digest in {self}")));
            }
        } else if self.author.contains(',') || self.author.contains('\0') {
            return Err(bad(format!("bad author in {self}")));
        }
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.r#gen
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn is_merge(&self) -> bool {
        self.r#gen == 0
    }

    /// The CAS counter if this version came from the CAS server, else 0.
    pub fn cas(&self) -> u64 {
        if self.author == CAS_SERVER { self.r#gen } else { 0 }
    }

    /// How this version relates to `vv`.
    pub fn compare_to(&self, vv: &VersionVector) -> VersionOrder {
        match vv.compare_to_version(self) {
            VersionOrder::Older => VersionOrder::Newer,
            VersionOrder::Newer => VersionOrder::Older,
            other => other,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_merge() {
            write!(f, "^{}", self.author)
        } else {
            write!(f, "{}@{}", self.r#gen, self.author)
        }
    }
}

impl std::str::FromStr for Version {
    type Err = RivetError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

// ---------------------------------------------------------------------------
// VersionVector
// ---------------------------------------------------------------------------

/// An ordered list of versions; position 0 is the most recent writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    vers: Vec<Version>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.contains('\0') {
            return Err(bad(s));
        }
        let mut vers = Vec::new();
        for part in s.split(',') {
            vers.push(Version::parse(part)?);
        }
        Ok(VersionVector { vers })
    }

    pub fn count(&self) -> usize {
        self.vers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vers.is_empty()
    }

    /// The most recent version.
    pub fn current(&self) -> Option<&Version> {
        self.vers.first()
    }

    pub fn versions(&self) -> &[Version] {
        &self.vers
    }

    pub fn gen_of_author(&self, author: &str) -> u64 {
        self.vers
            .iter()
            .find(|v| v.author == author)
            .map_or(0, |v| v.r#gen)
    }

    pub fn append(&mut self, version: Version) -> Result<()> {
        version.validate()?;
        self.vers.push(version);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Comparison
    // -----------------------------------------------------------------------

    /// How this vector relates to a single version: `Same` if that version is
    /// our current one, `Newer`/`Older` by the author's generation.
    pub fn compare_to_version(&self, v: &Version) -> VersionOrder {
        let Some(pos) = self.vers.iter().position(|mine| mine.author == v.author) else {
            return VersionOrder::Older;
        };
        let mine = &self.vers[pos];
        if mine.r#gen < v.r#gen {
            VersionOrder::Older
        } else if mine.r#gen == v.r#gen && pos == 0 {
            VersionOrder::Same
        } else {
            VersionOrder::Newer
        }
    }

    /// Compares two vectors over the union of their authors; an author
    /// missing from one side counts as generation 0. Mixed newer-and-older
    /// components yield `Conflicting`.
    pub fn compare_to(&self, other: &VersionVector) -> VersionOrder {
        if self.vers == other.vers {
            return VersionOrder::Same;
        }
        let mut order = 0u8;
        for v in &self.vers {
            let other_gen = other.gen_of_author(&v.author);
            if v.r#gen < other_gen {
                order |= VersionOrder::Older as u8;
            } else if v.r#gen > other_gen {
                order |= VersionOrder::Newer as u8;
            }
            if order == VersionOrder::Conflicting as u8 {
                return VersionOrder::Conflicting;
            }
        }
        for v in &other.vers {
            if self.gen_of_author(&v.author) == 0 && v.r#gen > 0 {
                order |= VersionOrder::Older as u8;
                break;
            }
        }
        VersionOrder::from_bits(order)
    }

    // -----------------------------------------------------------------------
    // Modification
    // -----------------------------------------------------------------------

    /// Bumps the author's generation, moving its version to the front.
    pub fn increment_gen(&mut self, author: &str) -> Result<()> {
        let version = if let Some(pos) = self.vers.iter().position(|v| v.author == author) {
            let existing = self.vers.remove(pos);
            if existing.is_merge() {
                return Err(bad("can't increment a merge version"));
            }
            Version {
                r#gen: existing.r#gen + 1,
                author: existing.author,
            }
        } else {
            Version::new(1, author)?
        };
        self.vers.insert(0, version);
        Ok(())
    }

    /// Replaces the local peer ID with the `"*"` shorthand.
    pub fn compact_my_peer_id(&mut self, my_id: &str) {
        if let Some(v) = self.vers.iter_mut().find(|v| v.author == my_id) {
            v.author = ME.to_string();
        }
    }

    /// Replaces the `"*"` shorthand with the real local peer ID.
    pub fn expand_my_peer_id(&mut self, my_id: &str) {
        if let Some(v) = self.vers.iter_mut().find(|v| v.author == ME) {
            v.author = my_id.to_string();
        }
    }

    pub fn is_expanded(&self) -> bool {
        self.vers.iter().all(|v| v.author != ME)
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merges two vectors, keeping each author's newer generation. The walk
    /// is positional, so the result order is approximate but deterministic.
    pub fn merged_with(&self, other: &VersionVector) -> VersionVector {
        let mut result = VersionVector::new();
        let max_len = self.vers.len().max(other.vers.len());
        for i in 0..max_len {
            if let Some(v) = self.vers.get(i) {
                if v.r#gen >= other.gen_of_author(&v.author) {
                    result.vers.push(v.clone());
                }
            }
            if let Some(v) = other.vers.get(i) {
                if v.r#gen > self.gen_of_author(&v.author) {
                    result.vers.push(v.clone());
                }
            }
        }
        result
    }

    /// The canonical form: `"*"` expanded to the local peer ID, versions
    /// sorted by author. This is the input to the merge-ID hash.
    pub fn canonical_string(&self, my_id: &str) -> String {
        let mut copy = self.clone();
        copy.expand_my_peer_id(my_id);
        copy.vers.sort_by(|a, b| a.author.cmp(&b.author));
        copy.to_string()
    }

    /// Prepends a merge version whose author is the base64 SHA-1 of the
    /// canonical string, a NUL byte, and the merged revision body.
    pub fn insert_merge_rev_id(&mut self, my_id: &str, revision_body: &[u8]) {
        let mut hasher = Sha1::new();
        hasher.update(self.canonical_string(my_id).as_bytes());
        hasher.update([0u8]);
        hasher.update(revision_body);
        let digest = hasher.finalize();
        let merge_id = BASE64.encode(digest);
        self.vers.insert(
            0,
            Version {
                r#gen: 0,
                author: merge_id,
            },
        );
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.vers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for VersionVector {
    type Err = RivetError;

    fn from_str(s: &str) -> Result<Self> {
        VersionVector::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(s: &str) -> VersionVector {
        VersionVector::parse(s).unwrap()
    }

    #[test]
    fn parse_and_display() {
        let v = vv("3@alice,1@$");
        assert_eq!(v.count(), 2);
        assert_eq!(v.current().unwrap().author(), "alice");
        assert_eq!(v.gen_of_author("alice"), 3);
        assert_eq!(v.gen_of_author("$"), 1);
        assert_eq!(v.gen_of_author("nobody"), 0);
        assert_eq!(v.to_string(), "3@alice,1@$");
    }

    #[test]
    fn parse_merge_version() {
        let v = vv("^abc+/=123,2@bob");
        assert!(v.current().unwrap().is_merge());
        assert_eq!(v.to_string(), "^abc+/=123,2@bob");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(VersionVector::parse("").is_err());
        assert!(VersionVector::parse("0@alice").is_err());
        assert!(VersionVector::parse("x@alice").is_err());
        assert!(VersionVector::parse("3@").is_err());
        assert!(VersionVector::parse("3@a,").is_err());
        assert!(Version::parse("^not valid!").is_err());
    }

    #[test]
    fn compare_basics() {
        assert_eq!(vv("1@a").compare_to(&vv("1@a")), VersionOrder::Same);
        assert_eq!(vv("1@a").compare_to(&vv("2@a")), VersionOrder::Older);
        assert_eq!(vv("2@a").compare_to(&vv("1@a")), VersionOrder::Newer);
        assert_eq!(
            vv("2@a,1@b").compare_to(&vv("1@a,2@b")),
            VersionOrder::Conflicting
        );
        // Missing authors count as generation 0.
        assert_eq!(vv("1@a,1@b").compare_to(&vv("1@a")), VersionOrder::Newer);
        assert_eq!(vv("1@a").compare_to(&vv("1@a,1@b")), VersionOrder::Older);
        assert_eq!(vv("1@a").compare_to(&vv("1@b")), VersionOrder::Conflicting);
    }

    #[test]
    fn compare_is_antisymmetric() {
        let cases = [
            ("1@a", "2@a"),
            ("3@a,1@b", "3@a,2@b"),
            ("1@a", "1@a,1@b"),
            ("5@x,2@y", "5@x,2@y,1@z"),
        ];
        for (a, b) in cases {
            let forward = vv(a).compare_to(&vv(b));
            let backward = vv(b).compare_to(&vv(a));
            assert_eq!(forward, VersionOrder::Older, "{a} vs {b}");
            assert_eq!(backward, VersionOrder::Newer, "{b} vs {a}");
        }
    }

    #[test]
    fn compare_to_single_version() {
        let v = vv("3@a,1@b");
        assert_eq!(
            v.compare_to_version(&Version::parse("3@a").unwrap()),
            VersionOrder::Same
        );
        assert_eq!(
            v.compare_to_version(&Version::parse("4@a").unwrap()),
            VersionOrder::Older
        );
        assert_eq!(
            v.compare_to_version(&Version::parse("1@b").unwrap()),
            VersionOrder::Newer // not the current version
        );
        assert_eq!(
            v.compare_to_version(&Version::parse("1@c").unwrap()),
            VersionOrder::Older
        );
    }

    #[test]
    fn increment_moves_to_front() {
        let mut v = vv("3@a,5@b");
        v.increment_gen("b").unwrap();
        assert_eq!(v.to_string(), "6@b,3@a");
        v.increment_gen("c").unwrap();
        assert_eq!(v.to_string(), "1@c,6@b,3@a");
    }

    #[test]
    fn merge_keeps_newest_per_author() {
        let a = vv("3@A,1@B");
        let b = vv("2@A,2@B");
        let merged = a.merged_with(&b);
        assert_eq!(merged.gen_of_author("A"), 3);
        assert_eq!(merged.gen_of_author("B"), 2);
        assert_eq!(a.compare_to(&merged), VersionOrder::Older);
        assert_eq!(b.compare_to(&merged), VersionOrder::Older);
    }

    #[test]
    fn merge_dominates_both_inputs() {
        let cases = [
            ("1@a", "1@b"),
            ("4@a,2@b", "3@a,7@b"),
            ("2@a,1@b,1@c", "1@a,2@b"),
        ];
        for (x, y) in cases {
            let a = vv(x);
            let b = vv(y);
            let merged = a.merged_with(&b);
            assert!(
                matches!(
                    merged.compare_to(&a),
                    VersionOrder::Newer | VersionOrder::Same
                ),
                "merge({x},{y}) vs {x}"
            );
            assert!(
                matches!(
                    merged.compare_to(&b),
                    VersionOrder::Newer | VersionOrder::Same
                ),
                "merge({x},{y}) vs {y}"
            );
        }
    }

    #[test]
    fn me_compaction_and_canonical_form() {
        let mut v = vv("2@*,1@zz");
        assert!(!v.is_expanded());
        v.expand_my_peer_id("alice");
        assert!(v.is_expanded());
        assert_eq!(v.to_string(), "2@alice,1@zz");
        v.compact_my_peer_id("alice");
        assert_eq!(v.to_string(), "2@*,1@zz");

        // Canonical form expands and sorts by author.
        assert_eq!(v.canonical_string("alice"), "2@alice,1@zz");
        let w = vv("1@zz,2@aa");
        assert_eq!(w.canonical_string("me"), "2@aa,1@zz");
    }

    #[test]
    fn merge_rev_id_is_deterministic() {
        let mut a = vv("3@A,2@B");
        let mut b = vv("3@A,2@B");
        a.insert_merge_rev_id("me", b"{\"merged\":true}");
        b.insert_merge_rev_id("me", b"{\"merged\":true}");
        assert_eq!(a, b);
        let head = a.current().unwrap();
        assert!(head.is_merge());
        assert_eq!(head.generation(), 0);
        // SHA-1 digest, base64-encoded: 28 characters.
        assert_eq!(head.author().len(), 28);

        let mut c = vv("3@A,2@B");
        c.insert_merge_rev_id("me", b"different body");
        assert_ne!(a.current().unwrap().author(), c.current().unwrap().author());
    }

    #[test]
    fn increment_merge_version_fails() {
        let mut v = vv("^YWJj,1@a");
        // The merge version's author is the base64 digest.
        let author = v.current().unwrap().author().to_string();
        assert!(v.increment_gen(&author).is_err());
    }
}
