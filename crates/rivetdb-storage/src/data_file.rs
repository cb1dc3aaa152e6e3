//! `DataFile`: a file-backed collection of named key stores with shared
//! sequence allocation and a single-writer transaction lock.
//!
//! All `DataFile` handles opened on the same path share one underlying
//! storage engine instance and one transaction mutex, so writer exclusion
//! holds across handles and threads within the process. Reads never take the
//! lock; they run on engine snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use rivetdb_core::ObserverList;
use rivetdb_core::error::{Result, RivetError};
use tracing::debug;

use crate::record::DocumentFlags;
use crate::shared_keys::SharedKeys;

// All stores live in a handful of fixed tables, namespaced by store name.
pub(crate) const RECORDS: TableDefinition<(&str, &[u8]), &[u8]> = TableDefinition::new("records");
pub(crate) const SEQUENCES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("sequences");
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
pub(crate) const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
pub(crate) const INDEXES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("indexes");

const SHARED_KEYS_KV: &str = "shared_keys";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionAlgorithm {
    #[default]
    None,
    Aes256,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub create: bool,
    pub read_only: bool,
    pub encryption: EncryptionAlgorithm,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            create: true,
            read_only: false,
            encryption: EncryptionAlgorithm::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Commit notification
// ---------------------------------------------------------------------------

/// One record change included in a committed transaction.
#[derive(Debug, Clone)]
pub struct CommitChange {
    pub key_store: String,
    pub key: Vec<u8>,
    pub sequence: u64,
    pub flags: DocumentFlags,
}

/// Callback invoked (synchronously) after a transaction commits.
#[derive(Clone)]
pub struct CommitObserver(Arc<dyn Fn(&[CommitChange]) + Send + Sync>);

impl CommitObserver {
    pub fn new(f: impl Fn(&[CommitChange]) + Send + Sync + 'static) -> Self {
        CommitObserver(Arc::new(f))
    }
}

impl PartialEq for CommitObserver {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ---------------------------------------------------------------------------
// Shared per-path state
// ---------------------------------------------------------------------------

pub(crate) struct SharedFile {
    pub(crate) path: PathBuf,
    pub(crate) db: Database,
    // Single-writer lock shared by every handle on this path.
    transaction_lock: Mutex<()>,
    pub(crate) shared_keys: Mutex<SharedKeys>,
}

fn file_map() -> &'static Mutex<HashMap<PathBuf, Weak<SharedFile>>> {
    static MAP: OnceLock<Mutex<HashMap<PathBuf, Weak<SharedFile>>>> = OnceLock::new();
    MAP.get_or_init(Default::default)
}

// ---------------------------------------------------------------------------
// DataFile
// ---------------------------------------------------------------------------

pub struct DataFile {
    shared: Arc<SharedFile>,
    read_only: bool,
    commit_observers: ObserverList<CommitObserver>,
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile").finish_non_exhaustive()
    }
}

impl DataFile {
    /// Opens (or creates) the data file at `path`. Handles opened on the
    /// same path share a storage engine instance and write lock.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<DataFile> {
        if options.encryption != EncryptionAlgorithm::None {
            return Err(RivetError::UnsupportedEncryption);
        }
        let path = path.as_ref().to_path_buf();
        let mut map = file_map().lock();
        let shared = match map.get(&path).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                if !options.create && !path.exists() {
                    return Err(RivetError::NotFound(format!(
                        "no data file at {}",
                        path.display()
                    )));
                }
                let db = Database::create(&path).map_err(RivetError::storage)?;
                let shared = Arc::new(SharedFile {
                    path: path.clone(),
                    db,
                    transaction_lock: Mutex::new(()),
                    shared_keys: Mutex::new(SharedKeys::new()),
                });
                Self::init_tables(&shared)?;
                Self::load_shared_keys(&shared)?;
                map.insert(path.clone(), Arc::downgrade(&shared));
                debug!(path = %path.display(), "opened data file");
                shared
            }
        };
        Ok(DataFile {
            shared,
            read_only: options.read_only,
            commit_observers: ObserverList::new(),
        })
    }

    // Creates all tables up front so readers never race table creation.
    fn init_tables(shared: &SharedFile) -> Result<()> {
        let wtx = shared.db.begin_write().map_err(RivetError::storage)?;
        wtx.open_table(RECORDS).map_err(RivetError::storage)?;
        wtx.open_table(SEQUENCES).map_err(RivetError::storage)?;
        wtx.open_table(META).map_err(RivetError::storage)?;
        wtx.open_table(KV).map_err(RivetError::storage)?;
        wtx.open_table(INDEXES).map_err(RivetError::storage)?;
        wtx.commit().map_err(RivetError::storage)?;
        Ok(())
    }

    fn load_shared_keys(shared: &SharedFile) -> Result<()> {
        let rtx = shared.db.begin_read().map_err(RivetError::storage)?;
        let kv = rtx.open_table(KV).map_err(RivetError::storage)?;
        if let Some(blob) = kv.get(SHARED_KEYS_KV).map_err(RivetError::storage)? {
            *shared.shared_keys.lock() = SharedKeys::decode(blob.value())?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn shared(&self) -> &Arc<SharedFile> {
        &self.shared
    }

    pub(crate) fn begin_read(&self) -> Result<ReadTransaction> {
        self.shared.db.begin_read().map_err(RivetError::storage)
    }

    /// Interns document property names and encodes a JSON body through the
    /// file's shared-keys dictionary. New names are persisted at the next
    /// commit.
    pub fn encode_body(&self, body: &serde_json::Value) -> Result<Vec<u8>> {
        self.shared.shared_keys.lock().encode_body(body)
    }

    pub fn decode_body(&self, raw: &[u8]) -> Result<serde_json::Value> {
        self.shared.shared_keys.lock().decode_body(raw)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Begins the file's exclusive write transaction; blocks while another
    /// transaction (on any handle to this path) is open.
    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        if self.read_only {
            return Err(RivetError::InvalidParameter(
                "data file is read-only".into(),
            ));
        }
        let guard = self.shared.transaction_lock.lock();
        let wtx = self.shared.db.begin_write().map_err(RivetError::storage)?;
        Ok(Transaction {
            data_file: self,
            _guard: guard,
            wtx: Some(wtx),
            changes: Vec::new(),
        })
    }

    pub fn add_commit_observer(&self, observer: CommitObserver) {
        self.commit_observers.add(observer, false);
    }

    pub fn remove_commit_observer(&self, observer: &CommitObserver) -> bool {
        self.commit_observers.remove(observer)
    }

    fn notify_commit(&self, changes: &[CommitChange]) {
        if !changes.is_empty() {
            self.commit_observers.iterate(|observer| (observer.0)(changes));
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// The single-writer transaction for one data file. Dropping without
/// [`Transaction::commit`] aborts, discarding all writes.
pub struct Transaction<'a> {
    data_file: &'a DataFile,
    _guard: MutexGuard<'a, ()>,
    wtx: Option<WriteTransaction>,
    changes: Vec<CommitChange>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn wtx(&self) -> &WriteTransaction {
        self.wtx.as_ref().expect("transaction already finished")
    }

    pub fn data_file(&self) -> &DataFile {
        self.data_file
    }

    /// Allocates the next sequence number for the given sequence owner.
    pub(crate) fn next_sequence(&self, owner: &str) -> Result<u64> {
        let key = format!("seq:{owner}");
        let mut meta = self.wtx().open_table(META).map_err(RivetError::storage)?;
        let current = meta
            .get(key.as_str())
            .map_err(RivetError::storage)?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        meta.insert(key.as_str(), next).map_err(RivetError::storage)?;
        Ok(next)
    }

    pub(crate) fn bump_purge_count(&self, store: &str) -> Result<()> {
        let key = format!("purge:{store}");
        let mut meta = self.wtx().open_table(META).map_err(RivetError::storage)?;
        let current = meta
            .get(key.as_str())
            .map_err(RivetError::storage)?
            .map(|g| g.value())
            .unwrap_or(0);
        meta.insert(key.as_str(), current + 1)
            .map_err(RivetError::storage)?;
        Ok(())
    }

    pub(crate) fn record_change(
        &mut self,
        key_store: &str,
        key: &[u8],
        sequence: u64,
        flags: DocumentFlags,
    ) {
        self.changes.push(CommitChange {
            key_store: key_store.to_string(),
            key: key.to_vec(),
            sequence,
            flags,
        });
    }

    /// Removes every record of the named store. Used when dropping an index.
    pub(crate) fn delete_all(&self, store: &str) -> Result<usize> {
        let mut records = self.wtx().open_table(RECORDS).map_err(RivetError::storage)?;
        let mut keys = Vec::new();
        {
            let range = records
                .range((store, &[][..])..)
                .map_err(RivetError::storage)?;
            for item in range {
                let (k, _) = item.map_err(RivetError::storage)?;
                let (name, key) = k.value();
                if name != store {
                    break;
                }
                keys.push(key.to_vec());
            }
        }
        for key in &keys {
            records
                .remove((store, key.as_slice()))
                .map_err(RivetError::storage)?;
        }
        Ok(keys.len())
    }

    /// Commits atomically, persisting any new shared keys, then notifies the
    /// data file's commit observers.
    pub fn commit(mut self) -> Result<()> {
        let wtx = self.wtx.take().expect("transaction already finished");
        {
            let mut shared_keys = self.data_file.shared.shared_keys.lock();
            if shared_keys.is_dirty() {
                let blob = shared_keys.encode();
                let mut kv = wtx.open_table(KV).map_err(RivetError::storage)?;
                kv.insert(SHARED_KEYS_KV, blob.as_slice())
                    .map_err(RivetError::storage)?;
                shared_keys.mark_clean();
            }
        }
        wtx.commit().map_err(RivetError::storage)?;
        let changes = std::mem::take(&mut self.changes);
        let data_file = self.data_file;
        drop(self); // release the write lock before notifying
        data_file.notify_commit(&changes);
        Ok(())
    }

    /// Aborts explicitly; equivalent to dropping the transaction.
    pub fn abort(mut self) {
        if let Some(wtx) = self.wtx.take() {
            let _ = wtx.abort();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(wtx) = self.wtx.take() {
            let _ = wtx.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.rivet");
        (dir, path)
    }

    #[test]
    fn open_and_reuse_shared_state() {
        let (_dir, path) = temp_file();
        let a = DataFile::open(&path, &OpenOptions::default()).unwrap();
        let b = DataFile::open(&path, &OpenOptions::default()).unwrap();
        assert!(Arc::ptr_eq(a.shared(), b.shared()));
    }

    #[test]
    fn encryption_is_unsupported() {
        let (_dir, path) = temp_file();
        let err = DataFile::open(
            &path,
            &OpenOptions {
                encryption: EncryptionAlgorithm::Aes256,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RivetError::UnsupportedEncryption));
    }

    #[test]
    fn open_without_create_fails_on_missing() {
        let (_dir, path) = temp_file();
        let err = DataFile::open(
            &path,
            &OpenOptions {
                create: false,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RivetError::NotFound(_)));
    }

    #[test]
    fn transactions_are_mutually_exclusive() {
        let (_dir, path) = temp_file();
        let db = Arc::new(DataFile::open(&path, &OpenOptions::default()).unwrap());

        let txn = db.begin_transaction().unwrap();
        let db2 = db.clone();
        let started = Arc::new(AtomicUsize::new(0));
        let started2 = started.clone();
        let handle = std::thread::spawn(move || {
            let inner = db2.begin_transaction().unwrap(); // blocks until commit
            started2.store(1, Ordering::SeqCst);
            inner.abort();
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(started.load(Ordering::SeqCst), 0, "second txn must block");
        txn.commit().unwrap();
        handle.join().unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequences_are_monotonic_per_owner() {
        let (_dir, path) = temp_file();
        let db = DataFile::open(&path, &OpenOptions::default()).unwrap();
        let txn = db.begin_transaction().unwrap();
        assert_eq!(txn.next_sequence("docs").unwrap(), 1);
        assert_eq!(txn.next_sequence("docs").unwrap(), 2);
        assert_eq!(txn.next_sequence("other").unwrap(), 1);
        txn.commit().unwrap();

        let txn = db.begin_transaction().unwrap();
        assert_eq!(txn.next_sequence("docs").unwrap(), 3);
        txn.abort();

        // Aborted allocation is discarded.
        let txn = db.begin_transaction().unwrap();
        assert_eq!(txn.next_sequence("docs").unwrap(), 3);
        txn.commit().unwrap();
    }
}
