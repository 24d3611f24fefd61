//! Storage driver contract for replicas.

use std::fmt::Debug;

use crate::{
    document::Document,
    error::StorageError,
    keys::{AuthorAddress, ShareAddress},
    query::Query,
};

pub mod memory;

/// Config key under which drivers record their schema version.
pub const CONFIG_SCHEMA_VERSION: &str = "schema-version";
/// Config key under which drivers record their share address.
pub const CONFIG_SHARE: &str = "share";
/// Schema version written by this crate.
pub const SCHEMA_VERSION: &str = "1";

/// Durable or in-memory storage of raw documents for one share, indexed by
/// (path, author), plus a monotonic local sequence counter.
///
/// The driver stores whatever its replica hands it; all validation and
/// conflict resolution happen above, in [`crate::Replica`]. The replica is
/// the only writer, so `upsert` never races with itself.
pub trait DocDriver: Debug + Send + Sync + 'static {
    /// The share this driver stores documents for.
    fn share(&self) -> &ShareAddress;

    /// Random id identifying this physical store.
    ///
    /// A fresh id is generated whenever a store is created or erased, so sync
    /// partners can detect that their cursors against it are stale.
    fn storage_id(&self) -> String;

    /// The highest local index assigned so far. Zero when empty.
    fn max_local_index(&self) -> Result<u64, StorageError>;

    /// The stored document at (path, author), if any. Does not filter
    /// expired documents; the caller decides what "now" means.
    fn get(&self, path: &str, author: &AuthorAddress)
        -> Result<Option<Document>, StorageError>;

    /// Run a query against the surviving documents, honoring the filter,
    /// history-mode, ordering, cursor and limit semantics of [`Query`].
    fn query_docs(&self, query: &Query, now: u64) -> Result<Vec<Document>, StorageError>;

    /// Store a document, replacing any prior document at the same
    /// (path, author), and assign it the next local index. Returns the
    /// document as stored.
    fn upsert(&self, doc: Document) -> Result<Document, StorageError>;

    /// Physically remove expired documents. Purely an optimization: expired
    /// documents are already excluded at read time. Returns the number of
    /// documents removed.
    fn purge_expired(&self, now: u64) -> Result<usize, StorageError>;

    /// Store a small key-value config entry.
    fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Read a config entry.
    fn get_config(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Delete a config entry. Returns whether it existed.
    fn delete_config(&self, key: &str) -> Result<bool, StorageError>;

    /// List all config keys, sorted.
    fn list_config_keys(&self) -> Result<Vec<String>, StorageError>;

    /// Whether this driver has been closed.
    fn is_closed(&self) -> bool;

    /// Close the driver. With `erase`, also drop all stored data. Closing is
    /// idempotent; every other operation on a closed driver fails with
    /// [`StorageError::Closed`].
    fn close(&self, erase: bool) -> Result<(), StorageError>;
}
