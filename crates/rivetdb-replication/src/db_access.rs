//! The replicator's view of a database: change enumeration, revision
//! insertion, revision/body lookup, checkpoint records, and blob access.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rivetdb_core::error::{Result, RivetError};
use rivetdb_core::revid;
use rivetdb_storage::{
    BothKeyStore, CommitObserver, ContentOption, DataFile, DocumentFlags, EnumerateBy,
    EnumeratorOptions, KeyStore, RecordEnumerator, RedbKeyStore, Transaction, VersionedDocument,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::debug;

use crate::echo::EchoCanceler;
use crate::protocol::ChangeEntry;

/// Content-addressed blob storage, provided by the database layer.
pub trait BlobAccess: Send + Sync {
    fn get_blob(&self, digest: &str) -> Result<Vec<u8>>;
    /// Stores the data, verifying/returning its digest.
    fn put_blob(&self, data: &[u8]) -> Result<String>;
    fn has_blob(&self, digest: &str) -> bool;
}

/// A revision received from a peer, ready to insert.
#[derive(Debug, Clone)]
pub struct RevToInsert {
    pub doc_id: String,
    pub rev_id: String,
    /// Ancestor revIDs, newest first, not including `rev_id`.
    pub history: Vec<String>,
    pub deleted: bool,
    pub body: Option<serde_json::Value>,
    /// The peer's sequence for checkpointing.
    pub remote_sequence: u64,
}

/// Replication checkpoint: how far push and pull have progressed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub local: u64,
    #[serde(default)]
    pub remote: serde_json::Value,
}

impl Checkpoint {
    pub fn remote_sequence(&self) -> u64 {
        self.remote.as_u64().unwrap_or(0)
    }
}

/// Shared handle to the storage objects replication needs.
#[derive(Clone)]
pub struct DbAccess {
    data_file: Arc<DataFile>,
    docs: Arc<BothKeyStore>,
    info: Arc<RedbKeyStore>,
    uuid: String,
    blobs: Option<Arc<dyn BlobAccess>>,
}

impl DbAccess {
    pub fn new(
        data_file: Arc<DataFile>,
        docs: Arc<BothKeyStore>,
        info: Arc<RedbKeyStore>,
        uuid: String,
        blobs: Option<Arc<dyn BlobAccess>>,
    ) -> DbAccess {
        DbAccess {
            data_file,
            docs,
            info,
            uuid,
            blobs,
        }
    }

    pub fn data_file(&self) -> &Arc<DataFile> {
        &self.data_file
    }

    pub fn docs(&self) -> &dyn KeyStore {
        self.docs.as_ref()
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn blobs(&self) -> Option<&Arc<dyn BlobAccess>> {
        self.blobs.as_ref()
    }

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    /// Records changed after `since`, in sequence order, tombstones
    /// included. Returns the entries and the last sequence scanned.
    pub fn changes_since(&self, since: u64, limit: usize) -> Result<(Vec<ChangeEntry>, u64)> {
        let options = EnumeratorOptions {
            include_deleted: true,
            content: ContentOption::MetaOnly,
            ..EnumeratorOptions::default()
        };
        let mut enumerator = RecordEnumerator::new(
            self.docs
                .new_enumerator(EnumerateBy::Sequence { since }, &options)?,
        );
        let mut entries = Vec::new();
        let mut last = since;
        while entries.len() < limit && enumerator.next()? {
            let record = enumerator.record();
            last = record.sequence;
            entries.push(ChangeEntry {
                sequence: record.sequence,
                doc_id: String::from_utf8_lossy(&record.key).into_owned(),
                rev_id: String::from_utf8_lossy(&revid::expand(&record.version)).into_owned(),
                deleted: record.flags.is_deleted(),
                body_size: record.body_size as u64,
            });
        }
        Ok((entries, last))
    }

    /// Subscribes to committed document changes; the guard unsubscribes on
    /// drop. Each event is the sequence of one committed change.
    pub fn subscribe_commits(&self) -> CommitSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let live = self.docs.live().name().to_string();
        let dead = self.docs.dead().name().to_string();
        let observer = CommitObserver::new(move |changes| {
            for change in changes {
                if change.key_store == live || change.key_store == dead {
                    let _ = tx.send(change.sequence);
                }
            }
        });
        self.data_file.add_commit_observer(observer.clone());
        CommitSubscription {
            rx,
            observer,
            data_file: self.data_file.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Revisions
    // -----------------------------------------------------------------------

    pub fn has_revision(&self, doc_id: &str, rev_id: &str) -> Result<bool> {
        let doc = VersionedDocument::load(self.docs(), doc_id.as_bytes())?;
        if !doc.exists() {
            return Ok(false);
        }
        let compact = revid::compact(rev_id.as_bytes())?;
        Ok(doc.tree().find(&compact).is_some())
    }

    /// Leaf revision IDs of a document, for the "known ancestors" answer.
    pub fn known_ancestors(&self, doc_id: &str) -> Result<Vec<String>> {
        let doc = VersionedDocument::load(self.docs(), doc_id.as_bytes())?;
        Ok(doc
            .tree()
            .leaves()
            .map(|node| node.expanded_rev_id())
            .collect())
    }

    /// The body, ancestry, and deletion state of one revision, for sending.
    pub fn rev_to_send(
        &self,
        doc_id: &str,
        rev_id: &str,
        max_history: usize,
    ) -> Result<(serde_json::Value, Vec<String>, bool)> {
        let doc = VersionedDocument::load(self.docs(), doc_id.as_bytes())?;
        let compact = revid::compact(rev_id.as_bytes())?;
        let index = doc.tree().find(&compact).ok_or_else(|| {
            RivetError::NotFound(format!("revision {rev_id} of {doc_id}"))
        })?;
        let node = doc.tree().get(index).unwrap();
        let deleted = node.is_deleted();
        let body = match &node.body {
            Some(raw) => self.data_file.decode_body(raw)?,
            None if deleted => serde_json::Value::Object(Default::default()),
            None => {
                return Err(RivetError::NotFound(format!(
                    "body of revision {rev_id} of {doc_id} is gone"
                )));
            }
        };
        let mut history = Vec::new();
        let mut at = index;
        while let Some(parent) = doc.tree().parent_of(at) {
            if history.len() >= max_history {
                break;
            }
            history.push(doc.tree().get(parent).unwrap().expanded_rev_id());
            at = parent;
        }
        Ok((body, history, deleted))
    }

    /// Inserts a pulled revision (with ancestry) into the document's tree.
    ///
    /// In no-conflicts mode an insertion that would create a new conflict is
    /// rejected. Newly inserted revisions are recorded in the echo canceler
    /// so the push side won't send them back.
    pub fn insert_revision(
        &self,
        rev: &RevToInsert,
        no_conflicts: bool,
        echo: Option<&EchoCanceler>,
        txn: &mut Transaction<'_>,
    ) -> Result<u64> {
        let mut doc = VersionedDocument::load_in_txn(self.docs(), rev.doc_id.as_bytes(), txn)?;

        let mut compact_history = Vec::with_capacity(rev.history.len() + 1);
        compact_history.push(revid::compact(rev.rev_id.as_bytes())?);
        for ancestor in &rev.history {
            compact_history.push(revid::compact(ancestor.as_bytes())?);
        }
        let history_refs: Vec<&[u8]> = compact_history.iter().map(Vec::as_slice).collect();

        let body_bytes = match &rev.body {
            Some(body) => Some(self.data_file.encode_body(body)?),
            None => None,
        };
        let has_attachments = rev
            .body
            .as_ref()
            .and_then(|b| b.get("_attachments"))
            .is_some();

        let was_conflicted = doc.tree().has_conflict();
        let common = doc
            .tree_mut()
            .insert_history(&history_refs, body_bytes, rev.deleted)?;
        if common == 0 && doc.exists() {
            debug!(doc = %rev.doc_id, rev = %rev.rev_id, "revision already present");
            return Ok(doc.sequence());
        }
        if no_conflicts && !was_conflicted && doc.tree().has_conflict() {
            return Err(RivetError::Conflict);
        }

        let extra = if has_attachments {
            DocumentFlags::HAS_ATTACHMENTS
        } else {
            DocumentFlags::NONE
        };
        let sequence = doc.save(self.docs(), extra, txn)?;
        if sequence == 0 {
            return Err(RivetError::Conflict);
        }
        if let Some(echo) = echo {
            echo.add_rev(rev.doc_id.as_bytes(), &compact_history[0]);
        }
        Ok(sequence)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Stable checkpoint identity for this database + peer + collection.
    pub fn checkpoint_id(&self, remote_name: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.uuid.as_bytes());
        hasher.update([0u8]);
        hasher.update(remote_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(b"_default");
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Reads a checkpoint record. `prefix` distinguishes our own progress
    /// from checkpoints peers store with us.
    pub fn read_checkpoint(
        &self,
        prefix: &str,
        id: &str,
    ) -> Result<Option<(Checkpoint, String)>> {
        let key = format!("{prefix}/{id}");
        let record = self.info.get(key.as_bytes(), ContentOption::EntireBody)?;
        if !record.exists {
            return Ok(None);
        }
        let checkpoint = serde_json::from_slice(record.body())?;
        let rev = String::from_utf8_lossy(&record.version).into_owned();
        Ok(Some((checkpoint, rev)))
    }

    /// Writes a checkpoint record, enforcing the revision check: `rev` must
    /// match the stored revision (or be `None` for a fresh record).
    pub fn write_checkpoint(
        &self,
        prefix: &str,
        id: &str,
        checkpoint: &Checkpoint,
        rev: Option<&str>,
    ) -> Result<String> {
        let key = format!("{prefix}/{id}");
        let current = self.read_checkpoint(prefix, id)?;
        let current_rev = current.as_ref().map(|(_, rev)| rev.as_str());
        if current_rev != rev {
            return Err(RivetError::Conflict);
        }
        let next_rev = (rev.and_then(|r| r.parse::<u64>().ok()).unwrap_or(0) + 1).to_string();
        let body = serde_json::to_vec(checkpoint)?;
        let mut txn = self.data_file.begin_transaction()?;
        self.info
            .set_kv(key.as_bytes(), next_rev.as_bytes(), &body, &mut txn)?;
        txn.commit()?;
        Ok(next_rev)
    }
}

/// Live commit-notification stream; unsubscribes when dropped.
pub struct CommitSubscription {
    pub rx: mpsc::UnboundedReceiver<u64>,
    observer: CommitObserver,
    data_file: Arc<DataFile>,
}

impl Drop for CommitSubscription {
    fn drop(&mut self) {
        self.data_file.remove_commit_observer(&self.observer);
    }
}
