//! RivetDB: an embedded document database with MVCC storage, per-document
//! revision trees, secondary indexes, document expiration, and peer
//! replication.
//!
//! A database is a directory holding the data file, a content-addressed
//! blob store, and a cross-process change notifier. Documents are JSON;
//! every edit produces a new revision in the document's tree, and conflicts
//! from replication are kept as extra leaves until resolved.

pub mod blob_store;
pub mod changes;
pub mod document;
pub mod query;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rivetdb_actor::notifier::CrossProcessNotifier;
use rivetdb_blip::Connection;
use rivetdb_core::error::{Result, RivetError};
use rivetdb_core::revid;
use rivetdb_index::{Index, IndexEnumerator, IndexEnumeratorOptions, IndexWriter, KeyRange, Reducer};
use rivetdb_replication::db_access::DbAccess;
use rivetdb_storage::{
    BothKeyStore, Capabilities, ContentOption, DataFile, DocumentFlags, EnumerateBy,
    EnumeratorOptions, IndexSpec, KeyStore, OpenOptions, RecordEnumerator, RedbKeyStore,
    VersionedDocument, expiry,
};

pub use blob_store::BlobStore;
pub use changes::{ChangeEvent, LiveChanges};
pub use document::{AttachmentMeta, Document, GetOptions, PutResponse};
pub use query::QueryRequest;
pub use rivetdb_core::error::{ErrorDomain, NetworkError};
pub use rivetdb_replication::{
    Activity, Connector, DocumentEnded, Replicator, ReplicatorOptions, ReplicatorStatus,
    ServeOptions, SingleUseConnector,
};
pub use rivetdb_storage::EncryptionAlgorithm;

const DOCS_STORE: &str = "docs";
const TOMBSTONES_STORE: &str = "tombstones";
const INFO_STORE: &str = "info";
const EXPIRY_STORE: &str = "expiry";
const UUID_KEY: &[u8] = b"db/uuid";

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub create: bool,
    pub read_only: bool,
    pub encryption: EncryptionAlgorithm,
    /// Revision-tree depth kept per document before pruning.
    pub rev_tree_depth: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            create: true,
            read_only: false,
            encryption: EncryptionAlgorithm::None,
            rev_tree_depth: 20,
        }
    }
}

struct Inner {
    dir: PathBuf,
    data_file: Arc<DataFile>,
    docs: Arc<BothKeyStore>,
    info: Arc<RedbKeyStore>,
    expiry: Arc<RedbKeyStore>,
    blobs: Arc<BlobStore>,
    uuid: String,
    options: DatabaseOptions,
    change_tx: broadcast::Sender<ChangeEvent>,
    commit_observer: rivetdb_storage::CommitObserver,
    notifier: Option<Arc<CrossProcessNotifier>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.data_file.remove_commit_observer(&self.commit_observer);
        if let Some(notifier) = &self.notifier {
            notifier.stop();
        }
    }
}

/// An open database. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or creates) the database directory at `path`.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Database> {
        let dir = path.as_ref().to_path_buf();
        if !dir.exists() {
            if !options.create {
                return Err(RivetError::NotFound(format!(
                    "no database at {}",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(&dir)?;
        }
        let data_file = Arc::new(DataFile::open(
            dir.join("data.rivet"),
            &OpenOptions {
                create: options.create,
                read_only: options.read_only,
                encryption: options.encryption,
            },
        )?);
        let docs = Arc::new(BothKeyStore::new(
            Box::new(data_file.key_store(DOCS_STORE, Capabilities::WITH_SEQUENCES)),
            Box::new(data_file.key_store(TOMBSTONES_STORE, Capabilities::WITH_SEQUENCES)),
        ));
        let info = Arc::new(data_file.key_store(INFO_STORE, Capabilities::NO_SEQUENCES));
        let expiry = Arc::new(data_file.key_store(EXPIRY_STORE, Capabilities::NO_SEQUENCES));
        let blobs = Arc::new(BlobStore::open(dir.join("blobs"))?);

        let uuid = {
            let existing = info.get(UUID_KEY, ContentOption::EntireBody)?;
            if existing.exists {
                String::from_utf8_lossy(existing.body()).into_owned()
            } else if options.read_only {
                return Err(RivetError::NotOpen);
            } else {
                let uuid = uuid::Uuid::new_v4().to_string();
                let mut txn = data_file.begin_transaction()?;
                info.set_kv(UUID_KEY, &[], uuid.as_bytes(), &mut txn)?;
                txn.commit()?;
                uuid
            }
        };

        // The cross-process notifier needs the async runtime for its
        // watcher; without one, in-process notifications still work.
        let notifier = if tokio::runtime::Handle::try_current().is_ok() {
            Some(CrossProcessNotifier::open(dir.join("notifier"))?)
        } else {
            None
        };

        let (change_tx, _) = broadcast::channel(256);
        let commit_observer = Self::make_commit_observer(
            change_tx.clone(),
            docs.clone(),
            notifier.clone(),
        );
        data_file.add_commit_observer(commit_observer.clone());

        debug!(dir = %dir.display(), %uuid, "database opened");
        Ok(Database {
            inner: Arc::new(Inner {
                dir,
                data_file,
                docs,
                info,
                expiry,
                blobs,
                uuid,
                options,
                change_tx,
                commit_observer,
                notifier,
            }),
        })
    }

    fn make_commit_observer(
        change_tx: broadcast::Sender<ChangeEvent>,
        docs: Arc<BothKeyStore>,
        notifier: Option<Arc<CrossProcessNotifier>>,
    ) -> rivetdb_storage::CommitObserver {
        rivetdb_storage::CommitObserver::new(move |changes| {
            let mut notified = false;
            for change in changes {
                if change.key_store != DOCS_STORE && change.key_store != TOMBSTONES_STORE {
                    continue;
                }
                notified = true;
                let rev = docs
                    .get(&change.key, ContentOption::MetaOnly)
                    .ok()
                    .filter(|r| r.exists)
                    .map(|r| String::from_utf8_lossy(&revid::expand(&r.version)).into_owned())
                    .unwrap_or_default();
                let _ = change_tx.send(ChangeEvent {
                    sequence: change.sequence,
                    id: String::from_utf8_lossy(&change.key).into_owned(),
                    rev,
                    deleted: change.flags.is_deleted(),
                });
            }
            if notified {
                if let Some(notifier) = &notifier {
                    if let Err(e) = notifier.notify() {
                        warn!(error = %e, "cross-process notify failed");
                    }
                }
            }
        })
    }

    /// Deletes a database directory and everything in it.
    pub fn delete_database(path: impl AsRef<Path>) -> Result<()> {
        std::fs::remove_dir_all(path.as_ref())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn doc_count(&self) -> Result<u64> {
        self.inner.docs.record_count(false)
    }

    pub fn last_sequence(&self) -> Result<u64> {
        self.inner.docs.last_sequence()
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Creates or updates a document. `body` may carry `_rev` (required when
    /// updating) and `_deleted`; a mismatched `_rev` is a conflict.
    pub fn put(&self, id: &str, body: Value) -> Result<PutResponse> {
        let mut parsed = Document::from_json(body)?;
        if parsed.id.is_empty() {
            parsed.id = id.to_string();
        } else if parsed.id != id {
            return Err(RivetError::InvalidParameter(
                "document _id does not match the id argument".into(),
            ));
        }
        self.store_edit(id, parsed.rev.as_deref(), parsed.deleted, parsed.data)
    }

    /// Updates a document with an explicit parent revision.
    pub fn update(&self, id: &str, rev: &str, body: Value) -> Result<PutResponse> {
        let parsed = Document::from_json(body)?;
        self.store_edit(id, Some(rev), parsed.deleted, parsed.data)
    }

    /// Deletes a document (writes a tombstone revision).
    pub fn delete(&self, id: &str, rev: &str) -> Result<PutResponse> {
        self.store_edit(id, Some(rev), true, Value::Object(Default::default()))
    }

    fn store_edit(
        &self,
        id: &str,
        parent_rev: Option<&str>,
        deleted: bool,
        data: Value,
    ) -> Result<PutResponse> {
        let inner = &self.inner;
        let mut txn = inner.data_file.begin_transaction()?;
        let mut doc = VersionedDocument::load_in_txn(inner.docs.as_ref(), id.as_bytes(), &mut txn)?;

        // The parent must be the current revision (or absent for creation,
        // unless the doc only exists as a tombstone).
        let current = doc.current_rev_id().map(|r| {
            String::from_utf8_lossy(&revid::expand(r)).into_owned()
        });
        let effective_parent = match (&current, parent_rev) {
            (Some(current_rev), Some(given)) if current_rev == given => Some(given.to_string()),
            (Some(current_rev), None) if doc.is_deleted() => {
                // Recreating a deleted doc without a rev extends the tombstone.
                Some(current_rev.clone())
            }
            (None, None) => None,
            (None, Some(_)) => return Err(RivetError::Conflict),
            (Some(_), None) => return Err(RivetError::Conflict),
            (Some(_), Some(_)) => return Err(RivetError::Conflict),
        };

        let new_rev = document::generate_rev_id(effective_parent.as_deref(), deleted, &data);
        let body_bytes = if deleted && data.as_object().is_none_or(|m| m.is_empty()) {
            None
        } else {
            Some(inner.data_file.encode_body(&data)?)
        };
        let parent_compact = effective_parent
            .as_deref()
            .map(|p| revid::compact(p.as_bytes()))
            .transpose()?;
        doc.tree_mut().insert(
            revid::compact(new_rev.as_bytes())?,
            body_bytes,
            deleted,
            parent_compact.as_deref(),
            false,
        )?;
        let pruned = doc.tree_mut().prune(inner.options.rev_tree_depth);
        if pruned > 0 {
            debug!(doc = id, pruned, "pruned old revisions");
        }

        let extra = if data.get("_attachments").is_some() {
            DocumentFlags::HAS_ATTACHMENTS
        } else {
            DocumentFlags::NONE
        };
        let sequence = doc.save(inner.docs.as_ref(), extra, &mut txn)?;
        if sequence == 0 {
            return Err(RivetError::Conflict);
        }
        txn.commit()?;
        Ok(PutResponse {
            id: id.to_string(),
            rev: new_rev,
            sequence,
        })
    }

    pub fn get(&self, id: &str) -> Result<Document> {
        self.get_with_opts(id, GetOptions::default())
    }

    pub fn get_with_opts(&self, id: &str, options: GetOptions) -> Result<Document> {
        let doc = VersionedDocument::load(self.inner.docs.as_ref(), id.as_bytes())?;
        if !doc.exists() {
            return Err(RivetError::NotFound(id.to_string()));
        }
        let node_index = match &options.rev {
            Some(rev) => doc
                .tree()
                .find(&revid::compact(rev.as_bytes())?)
                .ok_or_else(|| RivetError::NotFound(format!("{id}@{rev}")))?,
            None => {
                let current = doc
                    .tree()
                    .current_index()
                    .ok_or_else(|| RivetError::NotFound(id.to_string()))?;
                if doc.is_deleted() && !options.include_deleted {
                    return Err(RivetError::NotFound(id.to_string()));
                }
                current
            }
        };
        let node = doc.tree().get(node_index).unwrap();
        let mut data = match &node.body {
            Some(raw) => self.inner.data_file.decode_body(raw)?,
            None if node.is_deleted() => Value::Object(Default::default()),
            None => {
                return Err(RivetError::NotFound(format!(
                    "body of {id}@{} is no longer available",
                    node.expanded_rev_id()
                )));
            }
        };

        if options.conflicts {
            let current = doc.tree().current_index();
            let conflicts: Vec<Value> = doc
                .tree()
                .nodes()
                .iter()
                .enumerate()
                .filter(|(i, n)| Some(*i) != current && n.is_active())
                .map(|(_, n)| Value::String(n.expanded_rev_id()))
                .collect();
            if !conflicts.is_empty() {
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("_conflicts".into(), Value::Array(conflicts));
                }
            }
        }

        Ok(Document {
            id: id.to_string(),
            rev: Some(node.expanded_rev_id()),
            deleted: node.is_deleted(),
            data,
            sequence: doc.sequence(),
        })
    }

    /// Removes a document and its history entirely (no tombstone).
    pub fn purge(&self, id: &str) -> Result<bool> {
        let mut txn = self.inner.data_file.begin_transaction()?;
        expiry::set_expiration(self.inner.expiry.as_ref(), id.as_bytes(), 0, &mut txn)?;
        let removed = self.inner.docs.del(id.as_bytes(), &mut txn, 0, None)?;
        txn.commit()?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Changes
    // -----------------------------------------------------------------------

    pub fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeEvent>> {
        let options = EnumeratorOptions {
            include_deleted: true,
            content: ContentOption::MetaOnly,
            ..EnumeratorOptions::default()
        };
        let mut enumerator = RecordEnumerator::new(
            self.inner
                .docs
                .new_enumerator(EnumerateBy::Sequence { since }, &options)?,
        );
        let mut events = Vec::new();
        while events.len() < limit && enumerator.next()? {
            let record = enumerator.record();
            events.push(ChangeEvent {
                sequence: record.sequence,
                id: String::from_utf8_lossy(&record.key).into_owned(),
                rev: String::from_utf8_lossy(&revid::expand(&record.version)).into_owned(),
                deleted: record.flags.is_deleted(),
            });
        }
        Ok(events)
    }

    /// A live feed starting at `since`: backlog first, then new commits.
    pub fn live_changes(&self, since: u64) -> Result<LiveChanges> {
        // Subscribe before scanning so no commit can fall in between.
        let rx = self.inner.change_tx.subscribe();
        let backlog = self.changes_since(since, usize::MAX)?;
        Ok(LiveChanges::new(backlog, rx))
    }

    // -----------------------------------------------------------------------
    // Expiration
    // -----------------------------------------------------------------------

    /// Sets a document's expiration time (ms since epoch; 0 = never).
    pub fn set_expiration(&self, id: &str, timestamp_ms: u64) -> Result<()> {
        if !self
            .inner
            .docs
            .get(id.as_bytes(), ContentOption::MetaOnly)?
            .exists
        {
            return Err(RivetError::NotFound(id.to_string()));
        }
        let mut txn = self.inner.data_file.begin_transaction()?;
        expiry::set_expiration(self.inner.expiry.as_ref(), id.as_bytes(), timestamp_ms, &mut txn)?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_expiration(&self, id: &str) -> Result<u64> {
        expiry::get_expiration(self.inner.expiry.as_ref(), id.as_bytes())
    }

    pub fn next_expiration(&self) -> Result<u64> {
        expiry::next_expiration(self.inner.expiry.as_ref())
    }

    /// Deletes all documents whose expiration time has passed.
    pub fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        let mut txn = self.inner.data_file.begin_transaction()?;
        let purged = expiry::purge_expired(
            self.inner.expiry.as_ref(),
            self.inner.docs.as_ref(),
            now_ms,
            &mut txn,
            |doc_id| debug!(doc = %String::from_utf8_lossy(doc_id), "expired"),
        )?;
        txn.commit()?;
        Ok(purged)
    }

    /// Spawns a periodic TTL sweep on the current runtime.
    pub fn start_ttl_sweeper(&self, interval: Duration) -> TtlSweeper {
        let cancel = CancellationToken::new();
        let db = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match db.purge_expired(now_ms()) {
                            Ok(0) => {}
                            Ok(count) => debug!(count, "TTL sweep purged documents"),
                            Err(e) => warn!(error = %e, "TTL sweep failed"),
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
        TtlSweeper { cancel }
    }

    // -----------------------------------------------------------------------
    // Indexes & queries
    // -----------------------------------------------------------------------

    /// Registers a value index over a property path.
    pub fn create_index(&self, name: &str, expression: &str) -> Result<bool> {
        let spec = IndexSpec {
            name: name.to_string(),
            expression: expression.to_string(),
        };
        let mut txn = self.inner.data_file.begin_transaction()?;
        let created = self.inner.docs.create_index(&spec, &mut txn)?;
        txn.commit()?;
        Ok(created)
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        let mut txn = self.inner.data_file.begin_transaction()?;
        self.inner.docs.delete_index(name, &mut txn)?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_indexes(&self) -> Result<Vec<IndexSpec>> {
        self.inner.docs.get_indexes()
    }

    // Brings an index up to date with the document store.
    fn update_index(&self, spec: &IndexSpec) -> Result<Index> {
        let inner = &self.inner;
        let index = Index::open(&inner.data_file, &spec.name);
        let seq_key = format!("index-seq/{}", spec.name);
        let since = {
            let record = inner.info.get(seq_key.as_bytes(), ContentOption::EntireBody)?;
            if record.exists {
                String::from_utf8_lossy(record.body()).parse().unwrap_or(0)
            } else {
                0
            }
        };

        let options = EnumeratorOptions {
            include_deleted: true,
            content: ContentOption::MetaOnly,
            ..EnumeratorOptions::default()
        };
        let mut enumerator = RecordEnumerator::new(
            inner
                .docs
                .new_enumerator(EnumerateBy::Sequence { since }, &options)?,
        );
        let mut txn = inner.data_file.begin_transaction()?;
        let mut writer = IndexWriter::new(&index, &mut txn);
        let mut last = since;
        let mut updated = false;
        while enumerator.next()? {
            let record = enumerator.record();
            last = record.sequence;
            let mut keys = Vec::new();
            let mut values = Vec::new();
            if !record.flags.is_deleted() {
                let doc = VersionedDocument::load(inner.docs.as_ref(), &record.key)?;
                if let Some(node) = doc.tree().current() {
                    if let Some(raw) = &node.body {
                        let body = inner.data_file.decode_body(raw)?;
                        if let Some(value) = lookup_path(&body, &spec.expression) {
                            keys.push(rivetdb_core::collatable::encode_json(value));
                            values.push(serde_json::to_vec(value)?);
                        }
                    }
                }
            }
            updated |= writer.update(&record.key, record.sequence, &keys, &values)?;
        }
        if last > since {
            inner
                .info
                .set_kv(seq_key.as_bytes(), &[], last.to_string().as_bytes(), &mut txn)?;
            txn.commit()?;
            debug!(index = %spec.name, through = last, updated, "index updated");
        }
        Ok(index)
    }

    /// Queries an index by key range (or exact key set), bringing it up to
    /// date first.
    pub fn query_index(&self, name: &str, query: IndexQuery) -> Result<Vec<IndexRow>> {
        let spec = self
            .get_indexes()?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RivetError::NotFound(format!("index {name}")))?;
        let index = self.update_index(&spec)?;

        let options = IndexEnumeratorOptions {
            descending: query.descending,
            inclusive_start: query.inclusive_start,
            inclusive_end: query.inclusive_end,
            skip: query.skip,
            limit: query.limit.unwrap_or(u64::MAX),
            group_level: query.group_level,
        };
        let encode = |v: &Value| rivetdb_core::collatable::encode_json(v);
        let mut enumerator = match &query.keys {
            Some(keys) => {
                let ranges = keys
                    .iter()
                    .map(|k| KeyRange::single(encode(k)))
                    .collect();
                IndexEnumerator::over_ranges(&index, ranges, options, query.reduce)?
            }
            None => IndexEnumerator::over_range(
                &index,
                query.start_key.as_ref().map(&encode).unwrap_or_default(),
                None,
                query.end_key.as_ref().map(&encode).unwrap_or_default(),
                None,
                options,
                query.reduce,
            )?,
        };

        let mut rows = Vec::new();
        while enumerator.next()? {
            rows.push(IndexRow {
                key: enumerator.key_json()?,
                value: serde_json::from_slice(enumerator.value()).unwrap_or(Value::Null),
                doc_id: String::from_utf8_lossy(enumerator.doc_id()).into_owned(),
                sequence: enumerator.sequence(),
            });
        }
        Ok(rows)
    }

    /// Runs a JSON predicate query over all live documents.
    pub fn query(&self, request: QueryRequest) -> Result<Vec<Document>> {
        let mut enumerator = RecordEnumerator::new(
            self.inner
                .docs
                .new_enumerator(EnumerateBy::all_keys(), &EnumeratorOptions::default())?,
        );
        let mut documents = Vec::new();
        while enumerator.next()? {
            let record = enumerator.record();
            let id = String::from_utf8_lossy(&record.key).into_owned();
            match self.get(&id) {
                Ok(doc) => documents.push(doc),
                Err(RivetError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        query::run_query(documents, &request)
    }

    // -----------------------------------------------------------------------
    // Blobs
    // -----------------------------------------------------------------------

    pub fn blob_store(&self) -> &Arc<BlobStore> {
        &self.inner.blobs
    }

    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        self.inner.blobs.put(data)
    }

    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        self.inner.blobs.get(digest)
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// The handle replication uses to read and write this database.
    pub fn db_access(&self) -> DbAccess {
        DbAccess::new(
            self.inner.data_file.clone(),
            self.inner.docs.clone(),
            self.inner.info.clone(),
            self.inner.uuid.clone(),
            Some(self.inner.blobs.clone() as Arc<dyn rivetdb_replication::BlobAccess>),
        )
    }

    /// Starts replicating with a peer.
    pub fn replicate(
        &self,
        connector: Box<dyn Connector>,
        options: ReplicatorOptions,
    ) -> Replicator {
        Replicator::start(self.db_access(), connector, options)
    }

    /// Serves the passive side of the protocol on an established connection.
    pub fn serve(&self, connection: &Arc<Connection>) {
        rivetdb_replication::serve(self.db_access(), connection, ServeOptions::default());
    }
}

/// Handle stopping a background TTL sweep.
pub struct TtlSweeper {
    cancel: CancellationToken,
}

impl TtlSweeper {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TtlSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Options for [`Database::query_index`].
pub struct IndexQuery {
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    /// Exact keys to look up (multi-key query); overrides the range.
    pub keys: Option<Vec<Value>>,
    pub descending: bool,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    pub group_level: usize,
    pub reduce: Option<Box<dyn Reducer>>,
}

impl Default for IndexQuery {
    fn default() -> Self {
        IndexQuery {
            start_key: None,
            end_key: None,
            keys: None,
            descending: false,
            inclusive_start: true,
            inclusive_end: true,
            skip: 0,
            limit: None,
            group_level: 0,
            reduce: None,
        }
    }
}

impl IndexQuery {
    pub fn range(start_key: Option<Value>, end_key: Option<Value>) -> IndexQuery {
        IndexQuery {
            start_key,
            end_key,
            ..IndexQuery::default()
        }
    }
}

/// One row of an index query result.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub key: Value,
    pub value: Value,
    pub doc_id: String,
    pub sequence: u64,
}
