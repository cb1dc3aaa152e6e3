//! Core codecs and data structures for RivetDB: the collatable value
//! encoding, revision IDs and revision trees, version vectors, varints, and
//! the observer list used for change notification.

pub mod collatable;
pub mod error;
pub mod observer;
pub mod rev_tree;
pub mod revid;
pub mod varint;
pub mod version_vector;

pub use collatable::{CollatableBuilder, CollatableReader, Tag};
pub use error::{ErrorDomain, NetworkError, Result, RivetError};
pub use observer::ObserverList;
pub use rev_tree::{NO_PARENT, RevNode, RevTree, SEQ_NOT_YET};
pub use revid::RevId;
pub use version_vector::{Version, VersionOrder, VersionVector};
