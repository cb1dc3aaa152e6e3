//! Per-file shared-keys dictionary.
//!
//! Document bodies repeat the same small set of property names over and
//! over. Each data file keeps a dictionary interning eligible names the
//! first time they appear; stored bodies replace those names with short
//! numeric tokens. The dictionary only ever grows, and is persisted at
//! commit time, so a body encoded with any snapshot of the dictionary can be
//! decoded with that snapshot or any later one.

use rivetdb_core::error::{Result, RivetError};
use serde_json::Value;

const MAX_KEY_LENGTH: usize = 16;
const MAX_KEYS: usize = 2048;

// Encoded keys look like "~<id>"; literal keys starting with '~' are
// escaped as "~~<key>".
const TOKEN_PREFIX: char = '~';

fn is_eligible(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub struct SharedKeys {
    names: Vec<String>,
    dirty: bool,
}

impl Default for SharedKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedKeys {
    pub fn new() -> Self {
        SharedKeys {
            names: Vec::new(),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Serialized form: a JSON array of the interned names, in id order.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(&self.names).expect("string array always serializes")
    }

    pub fn decode(raw: &[u8]) -> Result<SharedKeys> {
        let names: Vec<String> = serde_json::from_slice(raw)?;
        Ok(SharedKeys {
            names,
            dirty: false,
        })
    }

    fn intern(&mut self, key: &str) -> Option<usize> {
        if let Some(id) = self.names.iter().position(|n| n == key) {
            return Some(id);
        }
        if !is_eligible(key) || self.names.len() >= MAX_KEYS {
            return None;
        }
        self.names.push(key.to_string());
        self.dirty = true;
        Some(self.names.len() - 1)
    }

    /// Encodes a body, replacing interned property names with tokens.
    pub fn encode_body(&mut self, body: &Value) -> Result<Vec<u8>> {
        let transformed = self.tokenize(body);
        Ok(serde_json::to_vec(&transformed)?)
    }

    pub fn decode_body(&self, raw: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(raw)?;
        self.detokenize(&value)
    }

    fn tokenize(&mut self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, v) in map {
                    let encoded_key = match self.intern(key) {
                        Some(id) => format!("{TOKEN_PREFIX}{id}"),
                        None if key.starts_with(TOKEN_PREFIX) => {
                            format!("{TOKEN_PREFIX}{key}")
                        }
                        None => key.clone(),
                    };
                    out.insert(encoded_key, self.tokenize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.tokenize(v)).collect()),
            other => other.clone(),
        }
    }

    fn detokenize(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, v) in map {
                    let decoded_key = if let Some(rest) = key.strip_prefix(TOKEN_PREFIX) {
                        if let Some(escaped) = rest.strip_prefix(TOKEN_PREFIX) {
                            format!("{TOKEN_PREFIX}{escaped}")
                        } else {
                            let id: usize = rest.parse().map_err(|_| {
                                RivetError::storage(format!("bad shared-key token {key:?}"))
                            })?;
                            self.names
                                .get(id)
                                .ok_or_else(|| {
                                    RivetError::storage(format!("unknown shared key id {id}"))
                                })?
                                .clone()
                        }
                    } else {
                        key.clone()
                    };
                    out.insert(decoded_key, self.detokenize(v)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.detokenize(v))
                    .collect::<Result<_>>()?,
            )),
            other => Ok(other.clone()),
        }
    }
}
