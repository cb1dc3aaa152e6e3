//! Collatable value encoding.
//!
//! Encodes heterogeneous values (null/bool/number/string/array/dict) into a
//! byte string whose lexicographic (`memcmp`) order matches JSON value order:
//! `null < false < true < number < string < array < dict`, numbers ordered
//! numerically, strings by a case-aware priority table, arrays and dicts
//! lexicographically by their encoded elements.

use crate::error::{Result, RivetError};

/// The first byte of every encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tag {
    EndSequence = 0,
    Null = 1,
    False = 2,
    True = 3,
    Number = 4,
    String = 5,
    Array = 6,
    Dict = 7,
    Error = 8,
}

impl Tag {
    fn from_byte(b: u8) -> Tag {
        match b {
            0 => Tag::EndSequence,
            1 => Tag::Null,
            2 => Tag::False,
            3 => Tag::True,
            4 => Tag::Number,
            5 => Tag::String,
            6 => Tag::Array,
            7 => Tag::Dict,
            _ => Tag::Error,
        }
    }
}

// Characters in ascending collation priority: control characters (absent from
// the map) collate lowest, then whitespace and punctuation, digits, and
// letters with each lowercase letter immediately before its uppercase form.
const INVERSE_MAP: &[u8] =
    b"\t\n\r `^_-,;:!?.'\"()[]{}@*/\\&#%+<=>|~$0123456789aAbBcCdDeEfFgGhHiIjJkKlLmMnNoOpPqQrRsStTuUvVwWxXyYzZ";

const fn build_priority() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < INVERSE_MAP.len() {
        table[INVERSE_MAP[i] as usize] = (i + 1) as u8;
        i += 1;
    }
    // High-bit bytes (UTF-8 continuations) map to themselves.
    let mut c = 128;
    while c < 256 {
        table[c] = c as u8;
        c += 1;
    }
    table
}

const fn build_inverse() -> [u8; 256] {
    let priority = build_priority();
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[priority[i] as usize] = i as u8;
        i += 1;
    }
    table
}

static CHAR_PRIORITY: [u8; 256] = build_priority();
static CHAR_INVERSE: [u8; 256] = build_inverse();

// Fraction digits of a non-integral number are emitted offset into
// 0x20..=0xFF so they can never be confused with a following tag byte.
const FRACTION_BASE: u64 = 224;
const FRACTION_OFFSET: u8 = 0x20;
const MAX_FRACTION_DIGITS: usize = 10;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incrementally builds a collatable byte string.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CollatableBuilder {
    data: Vec<u8>,
}

impl CollatableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_tag(&mut self, tag: Tag) -> &mut Self {
        self.data.push(tag as u8);
        self
    }

    pub fn add_null(&mut self) -> &mut Self {
        self.add_tag(Tag::Null)
    }

    pub fn add_bool(&mut self, b: bool) -> &mut Self {
        self.add_tag(if b { Tag::True } else { Tag::False })
    }

    pub fn add_int(&mut self, n: i64) -> &mut Self {
        self.add_tag(Tag::Number);
        self.push_int(n);
        self
    }

    // Length-and-sign byte, then the significant big-endian bytes.
    // Positive: 0x80 | nBytes. Negative: 127 - nBytes, bytes from the
    // two's-complement representation, keeping one leading 0xFF.
    fn push_int(&mut self, n: i64) {
        let bytes = n.to_be_bytes();
        let ignore: u8 = if n < 0 { 0xff } else { 0x00 };
        let mut i = 0;
        while i < 8 && bytes[i] == ignore {
            i += 1;
        }
        if n < 0 && i > 0 {
            i -= 1;
        }
        let n_bytes = (8 - i) as u8;
        let len_byte = if n >= 0 { 0x80 | n_bytes } else { 127 - n_bytes };
        self.data.push(len_byte);
        self.data.extend_from_slice(&bytes[i..]);
    }

    /// Encodes a floating-point number. Integral values use the integer
    /// encoding; otherwise the integer part is followed by base-224 fraction
    /// digits terminated by a zero byte, preserving numeric order.
    pub fn add_f64(&mut self, n: f64) -> &mut Self {
        let floor = n.floor();
        if floor == n && floor >= i64::MIN as f64 && floor <= i64::MAX as f64 {
            return self.add_int(floor as i64);
        }
        self.add_tag(Tag::Number);
        let int_part = floor.clamp(i64::MIN as f64, i64::MAX as f64) as i64;
        self.push_int(int_part);
        let mut frac = n - floor;
        let mut digits = 0;
        while frac > 0.0 && digits < MAX_FRACTION_DIGITS {
            frac *= FRACTION_BASE as f64;
            let digit = (frac as u64).min(FRACTION_BASE - 1);
            self.data.push(FRACTION_OFFSET + digit as u8);
            frac -= digit as f64;
            digits += 1;
        }
        self.data.push(0);
        self
    }

    pub fn add_string(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        self.add_tag(Tag::String);
        for &b in s.as_ref() {
            self.data.push(CHAR_PRIORITY[b as usize]);
        }
        self.data.push(0);
        self
    }

    pub fn begin_array(&mut self) -> &mut Self {
        self.add_tag(Tag::Array)
    }

    pub fn end_array(&mut self) -> &mut Self {
        self.add_tag(Tag::EndSequence)
    }

    pub fn begin_map(&mut self) -> &mut Self {
        self.add_tag(Tag::Dict)
    }

    pub fn end_map(&mut self) -> &mut Self {
        self.add_tag(Tag::EndSequence)
    }

    /// Appends already-encoded collatable data verbatim.
    pub fn add_encoded(&mut self, encoded: &[u8]) -> &mut Self {
        self.data.extend_from_slice(encoded);
        self
    }

    pub fn add_json(&mut self, value: &serde_json::Value) -> &mut Self {
        use serde_json::Value;
        match value {
            Value::Null => self.add_null(),
            Value::Bool(b) => self.add_bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.add_int(i)
                } else if let Some(u) = n.as_u64() {
                    self.add_int(u as i64)
                } else {
                    self.add_f64(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => self.add_string(s),
            Value::Array(items) => {
                self.begin_array();
                for item in items {
                    self.add_json(item);
                }
                self.end_array()
            }
            Value::Object(map) => {
                self.begin_map();
                for (k, v) in map {
                    self.add_string(k);
                    self.add_json(v);
                }
                self.end_map()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads values back out of a collatable byte string.
pub struct CollatableReader<'a> {
    data: &'a [u8],
}

impl<'a> CollatableReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn at_end(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }

    /// The tag of the next value, without consuming it.
    pub fn next_tag(&self) -> Tag {
        if self.data.is_empty() {
            Tag::EndSequence
        } else {
            Tag::from_byte(self.data[0])
        }
    }

    fn corrupt(what: &str) -> RivetError {
        RivetError::CorruptIndexData(format!("malformed collatable data: {what}"))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Self::corrupt("unexpected end"));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn expect_tag(&mut self, tag: Tag) -> Result<()> {
        let b = self.take(1)?[0];
        if b != tag as u8 {
            return Err(Self::corrupt("unexpected tag"));
        }
        Ok(())
    }

    pub fn read_null(&mut self) -> Result<()> {
        self.expect_tag(Tag::Null)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match Tag::from_byte(self.take(1)?[0]) {
            Tag::False => Ok(false),
            Tag::True => Ok(true),
            _ => Err(Self::corrupt("expected boolean")),
        }
    }

    // Decodes the integer part after the Number tag has been consumed.
    fn read_int_body(&mut self) -> Result<i64> {
        let len_byte = self.take(1)?[0];
        let (n_bytes, fill) = if len_byte & 0x80 != 0 {
            ((len_byte & 0x7f) as usize, 0x00u8)
        } else {
            ((127 - len_byte) as usize, 0xffu8)
        };
        if n_bytes > 8 {
            return Err(Self::corrupt("oversized number"));
        }
        let bytes = self.take(n_bytes)?;
        let mut buf = [fill; 8];
        buf[8 - n_bytes..].copy_from_slice(bytes);
        Ok(i64::from_be_bytes(buf))
    }

    // Consumes fraction digits if the next bytes are part of this number.
    fn read_fraction(&mut self) -> Result<f64> {
        if self.data.first().is_none_or(|&b| b < FRACTION_OFFSET) {
            return Ok(0.0);
        }
        let mut frac = 0.0f64;
        let mut scale = 1.0f64;
        while let Some(&b) = self.data.first() {
            if b == 0 {
                self.take(1)?;
                return Ok(frac);
            }
            if b < FRACTION_OFFSET {
                return Err(Self::corrupt("bad fraction digit"));
            }
            scale /= FRACTION_BASE as f64;
            frac += f64::from(b - FRACTION_OFFSET) * scale;
            self.take(1)?;
        }
        Err(Self::corrupt("unterminated fraction"))
    }

    /// Reads an integer. Fails if the encoded number has a fractional part.
    pub fn read_int(&mut self) -> Result<i64> {
        self.expect_tag(Tag::Number)?;
        let n = self.read_int_body()?;
        if self.read_fraction()? != 0.0 {
            return Err(Self::corrupt("expected integer"));
        }
        Ok(n)
    }

    pub fn read_number(&mut self) -> Result<f64> {
        self.expect_tag(Tag::Number)?;
        let int_part = self.read_int_body()?;
        let frac = self.read_fraction()?;
        Ok(int_part as f64 + frac)
    }

    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        self.expect_tag(Tag::String)?;
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Self::corrupt("unterminated string"))?;
        let mapped = self.take(end)?;
        let result = mapped.iter().map(|&b| CHAR_INVERSE[b as usize]).collect();
        self.take(1)?; // terminator
        Ok(result)
    }

    pub fn begin_array(&mut self) -> Result<()> {
        self.expect_tag(Tag::Array)
    }

    pub fn end_array(&mut self) -> Result<()> {
        self.expect_tag(Tag::EndSequence)
    }

    pub fn begin_map(&mut self) -> Result<()> {
        self.expect_tag(Tag::Dict)
    }

    pub fn end_map(&mut self) -> Result<()> {
        self.expect_tag(Tag::EndSequence)
    }

    /// Skips one entire value of any type, returning its encoded bytes.
    pub fn read(&mut self) -> Result<&'a [u8]> {
        let start = self.data;
        self.skip_value()?;
        Ok(&start[..start.len() - self.data.len()])
    }

    fn skip_value(&mut self) -> Result<()> {
        match Tag::from_byte(self.take(1)?[0]) {
            Tag::Null | Tag::False | Tag::True => Ok(()),
            Tag::Number => {
                let len_byte = self.take(1)?[0];
                let n_bytes = if len_byte & 0x80 != 0 {
                    (len_byte & 0x7f) as usize
                } else {
                    (127 - len_byte) as usize
                };
                self.take(n_bytes)?;
                self.read_fraction()?;
                Ok(())
            }
            Tag::String => {
                let end = self
                    .data
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| Self::corrupt("unterminated string"))?;
                self.take(end + 1)?;
                Ok(())
            }
            Tag::Array => {
                while self.next_tag() != Tag::EndSequence {
                    self.skip_value()?;
                }
                self.take(1)?;
                Ok(())
            }
            Tag::Dict => {
                while self.next_tag() != Tag::EndSequence {
                    self.skip_value()?;
                    self.skip_value()?;
                }
                self.take(1)?;
                Ok(())
            }
            Tag::EndSequence | Tag::Error => Err(Self::corrupt("unexpected tag")),
        }
    }

    /// Decodes the next value back into JSON, mainly for diagnostics and
    /// group-key reconstruction.
    pub fn read_json(&mut self) -> Result<serde_json::Value> {
        use serde_json::Value;
        match self.next_tag() {
            Tag::Null => {
                self.read_null()?;
                Ok(Value::Null)
            }
            Tag::False | Tag::True => Ok(Value::Bool(self.read_bool()?)),
            Tag::Number => {
                let n = self.read_number()?;
                if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
                    Ok(Value::from(n as i64))
                } else {
                    Ok(Value::from(n))
                }
            }
            Tag::String => {
                let bytes = self.read_string()?;
                Ok(Value::String(
                    String::from_utf8(bytes)
                        .map_err(|_| Self::corrupt("non-UTF-8 string"))?,
                ))
            }
            Tag::Array => {
                self.begin_array()?;
                let mut items = Vec::new();
                while self.next_tag() != Tag::EndSequence {
                    items.push(self.read_json()?);
                }
                self.end_array()?;
                Ok(Value::Array(items))
            }
            Tag::Dict => {
                self.begin_map()?;
                let mut map = serde_json::Map::new();
                while self.next_tag() != Tag::EndSequence {
                    let key = String::from_utf8(self.read_string()?)
                        .map_err(|_| Self::corrupt("non-UTF-8 key"))?;
                    map.insert(key, self.read_json()?);
                }
                self.end_map()?;
                Ok(Value::Object(map))
            }
            Tag::EndSequence | Tag::Error => Err(Self::corrupt("unexpected tag")),
        }
    }
}

/// Encodes a single JSON value.
pub fn encode_json(value: &serde_json::Value) -> Vec<u8> {
    let mut builder = CollatableBuilder::new();
    builder.add_json(value);
    builder.into_bytes()
}
