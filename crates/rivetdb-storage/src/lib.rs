//! Transactional key/value storage for RivetDB: data files, key stores,
//! the live/tombstone composite store, record enumeration, document
//! expiration, and the shared-keys dictionary.

pub mod both_key_store;
pub mod data_file;
pub mod enumerator;
pub mod expiry;
pub mod key_store;
pub mod record;
pub mod shared_keys;
pub mod versioned_doc;

pub use both_key_store::BothKeyStore;
pub use data_file::{
    CommitChange, CommitObserver, DataFile, EncryptionAlgorithm, OpenOptions, Transaction,
};
pub use enumerator::{EnumerateBy, EnumeratorImpl, EnumeratorOptions, RecordEnumerator};
pub use key_store::{Capabilities, IndexSpec, KeyStore, RedbKeyStore, index_store_name};
pub use record::{ContentOption, DocumentFlags, ReadBy, Record, RecordUpdate};
pub use shared_keys::SharedKeys;
pub use versioned_doc::VersionedDocument;
