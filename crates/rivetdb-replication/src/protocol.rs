//! The replication message vocabulary carried over BLIP.
//!
//! Profiles:
//! - `getCheckpoint` / `setCheckpoint`: persisted progress markers.
//! - `subChanges`: asks the peer to start sending `changes`.
//! - `changes`: batches of `[sequence, docID, revID, deleted, bodySize]`
//!   tuples; the response says which revisions to send and which ancestors
//!   the responder already has.
//! - `rev`: one revision, with its history and JSON body.
//! - `norev`: notification that an announced revision can't be delivered.
//! - `getAttachment`: fetches a blob by digest.

use rivetdb_core::error::{Result, RivetError};
use serde_json::{Value, json};

pub const PROFILE_GET_CHECKPOINT: &str = "getCheckpoint";
pub const PROFILE_SET_CHECKPOINT: &str = "setCheckpoint";
pub const PROFILE_SUB_CHANGES: &str = "subChanges";
pub const PROFILE_CHANGES: &str = "changes";
pub const PROFILE_REV: &str = "rev";
pub const PROFILE_NO_REV: &str = "norev";
pub const PROFILE_GET_ATTACHMENT: &str = "getAttachment";

pub const PROP_CLIENT: &str = "client";
pub const PROP_REV: &str = "rev";
pub const PROP_SINCE: &str = "since";
pub const PROP_CONTINUOUS: &str = "continuous";
pub const PROP_ID: &str = "id";
pub const PROP_HISTORY: &str = "history";
pub const PROP_SEQUENCE: &str = "sequence";
pub const PROP_DELETED: &str = "deleted";
pub const PROP_DIGEST: &str = "digest";
pub const PROP_MAX_HISTORY: &str = "maxHistory";

/// One entry of a `changes` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub sequence: u64,
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    pub body_size: u64,
}

impl ChangeEntry {
    fn to_json(&self) -> Value {
        json!([
            self.sequence,
            self.doc_id,
            self.rev_id,
            if self.deleted { 1 } else { 0 },
            self.body_size
        ])
    }

    fn from_json(value: &Value) -> Result<ChangeEntry> {
        let items = value
            .as_array()
            .ok_or_else(|| bad_changes("entry is not an array"))?;
        if items.len() < 3 {
            return Err(bad_changes("entry too short"));
        }
        Ok(ChangeEntry {
            sequence: items[0].as_u64().ok_or_else(|| bad_changes("sequence"))?,
            doc_id: items[1]
                .as_str()
                .ok_or_else(|| bad_changes("docID"))?
                .to_string(),
            rev_id: items[2]
                .as_str()
                .ok_or_else(|| bad_changes("revID"))?
                .to_string(),
            deleted: items.get(3).and_then(Value::as_i64).unwrap_or(0) != 0,
            body_size: items.get(4).and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

fn bad_changes(what: &str) -> RivetError {
    RivetError::RemoteError {
        domain: "RivetDB".into(),
        code: 400,
        message: format!("malformed changes message: {what}"),
    }
}

pub fn encode_changes(entries: &[ChangeEntry]) -> Vec<u8> {
    let array: Vec<Value> = entries.iter().map(ChangeEntry::to_json).collect();
    serde_json::to_vec(&array).expect("JSON arrays always serialize")
}

pub fn decode_changes(body: &[u8]) -> Result<Vec<ChangeEntry>> {
    let value: Value = serde_json::from_slice(body)?;
    let items = value
        .as_array()
        .ok_or_else(|| bad_changes("body is not an array"))?;
    items.iter().map(ChangeEntry::from_json).collect()
}

/// Per-entry answer to a `changes` message: the revisions the responder
/// wants, with any ancestors it already has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeResponse {
    /// Don't send this revision.
    Skip,
    /// Send it; these ancestor revIDs are already known.
    Wanted { known_ancestors: Vec<String> },
}

pub fn encode_changes_response(responses: &[ChangeResponse]) -> Vec<u8> {
    let array: Vec<Value> = responses
        .iter()
        .map(|r| match r {
            ChangeResponse::Skip => Value::Null,
            ChangeResponse::Wanted { known_ancestors } => json!(known_ancestors),
        })
        .collect();
    serde_json::to_vec(&array).expect("JSON arrays always serialize")
}

pub fn decode_changes_response(body: &[u8]) -> Result<Vec<ChangeResponse>> {
    let value: Value = serde_json::from_slice(body)?;
    let items = value
        .as_array()
        .ok_or_else(|| bad_changes("response is not an array"))?;
    items
        .iter()
        .map(|item| match item {
            Value::Null => Ok(ChangeResponse::Skip),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(ChangeResponse::Skip),
            Value::Array(ancestors) => Ok(ChangeResponse::Wanted {
                known_ancestors: ancestors
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            }),
            _ => Err(bad_changes("response entry")),
        })
        .collect()
}

/// Joins a revision history list (ancestors, newest first) for the `rev`
/// message's `history` property.
pub fn encode_history(ancestors: &[String]) -> String {
    ancestors.join(",")
}

pub fn decode_history(history: &str) -> Vec<String> {
    if history.is_empty() {
        Vec::new()
    } else {
        history.split(',').map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_roundtrip() {
        let entries = vec![
            ChangeEntry {
                sequence: 3,
                doc_id: "doc1".into(),
                rev_id: "2-beef".into(),
                deleted: false,
                body_size: 42,
            },
            ChangeEntry {
                sequence: 9,
                doc_id: "doc2".into(),
                rev_id: "1-aa".into(),
                deleted: true,
                body_size: 0,
            },
        ];
        let encoded = encode_changes(&entries);
        assert_eq!(decode_changes(&encoded).unwrap(), entries);
    }

    #[test]
    fn changes_response_roundtrip() {
        let responses = vec![
            ChangeResponse::Skip,
            ChangeResponse::Wanted {
                known_ancestors: vec!["1-aa".into()],
            },
            ChangeResponse::Wanted {
                known_ancestors: vec![],
            },
        ];
        let encoded = encode_changes_response(&responses);
        assert_eq!(decode_changes_response(&encoded).unwrap(), responses);
        // A numeric 0 entry also means skip.
        assert_eq!(
            decode_changes_response(b"[0]").unwrap(),
            vec![ChangeResponse::Skip]
        );
    }

    #[test]
    fn history_roundtrip() {
        assert_eq!(encode_history(&[]), "");
        assert_eq!(decode_history(""), Vec::<String>::new());
        let h = vec!["2-bb".to_string(), "1-aa".to_string()];
        assert_eq!(decode_history(&encode_history(&h)), h);
    }

    #[test]
    fn malformed_changes_rejected() {
        assert!(decode_changes(b"{}").is_err());
        assert!(decode_changes(b"[[1]]").is_err());
        assert!(decode_changes(b"[[1, \"d\", 3]]").is_err());
    }
}
