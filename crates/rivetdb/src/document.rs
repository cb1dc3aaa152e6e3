//! The public document type and revision ID generation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use rivetdb_core::error::{Result, RivetError};

/// Metadata of one attachment referenced from a document's `_attachments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub content_type: String,
    pub digest: String,
    pub length: u64,
    #[serde(default)]
    pub stub: bool,
}

/// A document as seen by the public API.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub deleted: bool,
    pub data: Value,
    pub sequence: u64,
}

impl Document {
    /// Builds a document from a JSON value, extracting the `_id`, `_rev`,
    /// and `_deleted` underscore fields.
    pub fn from_json(mut value: Value) -> Result<Document> {
        let obj = value.as_object_mut().ok_or_else(|| {
            RivetError::InvalidParameter("document must be a JSON object".into())
        })?;
        let id = obj
            .remove("_id")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        let rev = obj.remove("_rev").and_then(|v| v.as_str().map(String::from));
        let deleted = obj
            .remove("_deleted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Document {
            id,
            rev,
            deleted,
            data: value,
            sequence: 0,
        })
    }

    /// Converts back to JSON with the underscore fields included.
    pub fn to_json(&self) -> Value {
        let mut obj = match &self.data {
            Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };
        obj.insert("_id".into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            obj.insert("_rev".into(), Value::String(rev.clone()));
        }
        if self.deleted {
            obj.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(obj)
    }

    pub fn attachments(&self) -> HashMap<String, AttachmentMeta> {
        self.data
            .get("_attachments")
            .and_then(|a| serde_json::from_value(a.clone()).ok())
            .unwrap_or_default()
    }
}

/// Options for fetching a document.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Retrieve a specific revision instead of the winner.
    pub rev: Option<String>,
    /// Include conflicting leaf revisions in `_conflicts`.
    pub conflicts: bool,
    /// Include tombstones instead of reporting NotFound.
    pub include_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub id: String,
    pub rev: String,
    pub sequence: u64,
}

/// Generates the revision ID for a new edit: generation one past the
/// parent's, digest over the parent revision, the deletion flag, and the
/// canonical body JSON. The same edit therefore gets the same ID on every
/// replica.
pub fn generate_rev_id(parent: Option<&str>, deleted: bool, body: &Value) -> String {
    let generation = parent
        .and_then(|p| rivetdb_core::revid::parse(p.as_bytes()))
        .map(|(generation, _)| generation)
        .unwrap_or(0)
        + 1;
    let mut hasher = Sha1::new();
    if let Some(parent) = parent {
        hasher.update((parent.len() as u32).to_be_bytes());
        hasher.update(parent.as_bytes());
    } else {
        hasher.update(0u32.to_be_bytes());
    }
    hasher.update([u8::from(deleted)]);
    hasher.update(serde_json::to_vec(body).unwrap_or_default());
    format!("{generation}-{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_extracts_underscore_fields() {
        let doc = Document::from_json(json!({
            "_id": "doc1",
            "_rev": "1-abc",
            "name": "Alice"
        }))
        .unwrap();
        assert_eq!(doc.id, "doc1");
        assert_eq!(doc.rev.as_deref(), Some("1-abc"));
        assert!(!doc.deleted);
        assert_eq!(doc.data, json!({"name": "Alice"}));

        let back = doc.to_json();
        assert_eq!(back["_id"], "doc1");
        assert_eq!(back["_rev"], "1-abc");
        assert_eq!(back["name"], "Alice");
    }

    #[test]
    fn non_object_rejected() {
        assert!(Document::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn rev_ids_are_deterministic_and_chained() {
        let body = json!({"n": 1});
        let r1 = generate_rev_id(None, false, &body);
        assert!(r1.starts_with("1-"));
        assert_eq!(r1, generate_rev_id(None, false, &body));

        let r2 = generate_rev_id(Some(&r1), false, &body);
        assert!(r2.starts_with("2-"));
        assert_ne!(r1[2..], r2[2..]);

        // Different content, parent, or deletion changes the digest.
        assert_ne!(r1, generate_rev_id(None, false, &json!({"n": 2})));
        assert_ne!(
            generate_rev_id(Some(&r1), false, &body),
            generate_rev_id(Some(&r1), true, &body)
        );
    }

    #[test]
    fn attachments_parsed_from_body() {
        let doc = Document::from_json(json!({
            "_id": "doc1",
            "_attachments": {
                "photo": {"content_type": "image/png", "digest": "sha1-abc", "length": 10, "stub": true}
            }
        }))
        .unwrap();
        let attachments = doc.attachments();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments["photo"].digest, "sha1-abc");
        assert!(attachments["photo"].stub);
    }
}
