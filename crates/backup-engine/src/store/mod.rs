//! The document store being backed up and restored into.
//!

use core::fmt::Debug;
use std::io;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::object_id::display_id;

mod directory;
mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// The primary key of every document.
pub const ID_FIELD: &str = "_id";

/// A single document.
pub type Document = Map<String, Value>;

/// A streaming read over a collection.
pub type DocumentCursor<'a> = Box<dyn Iterator<Item = Result<Document, StoreError>> + 'a>;

/// Read and write primitives of a document store, per collection.
pub trait DocumentStore: Debug + Send + Sync {
    /// The name of the database.
    fn name(&self) -> String;

    /// Every collection currently known to the store.
    fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Read every document of a collection.
    fn read_all(&self, collection: &str) -> Result<DocumentCursor<'_>, StoreError>;

    /// Insert a single document, failing with [`StoreError::Duplicate`] if its identifier exists.
    fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Insert many documents, unordered. Individual failures do not stop the remaining inserts.
    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertManyOutcome, StoreError>;

    /// Replace the document with the same identifier or insert it if absent.
    fn upsert(&self, collection: &str, document: Document) -> Result<UpsertOutcome, StoreError>;

    /// Drop a collection. Returns if the collection existed.
    fn drop_collection(&self, collection: &str) -> Result<bool, StoreError>;
}

/// The result of an unordered bulk insert.
#[derive(Debug, Default)]
pub struct InsertManyOutcome {
    /// The number of documents inserted.
    pub inserted: u64,

    /// The documents that could not be inserted.
    pub failures: Vec<DocumentFailure>,
}

/// A document that could not be written.
#[derive(Debug)]
pub struct DocumentFailure {
    /// The document's identifier, if it had one.
    pub id: Option<String>,

    /// Why the write failed.
    pub error: StoreError,
}

/// What an upsert did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No document had the identifier.
    Inserted,

    /// An existing document was replaced.
    Updated,
}

/// The identifier of a document in a human readable form.
pub fn document_id(document: &Document) -> Option<String> {
    document.get(ID_FIELD).map(display_id)
}

/// A key identifying a document's `_id` for equality checks.
pub(crate) fn id_key(value: &Value) -> String {
    value.to_string()
}

/// Collection names become file names, only `[a-zA-Z0-9_\-.]` is accepted.
pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.'))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("The store is unavailable:\n{0}")]
    Unavailable(String),

    #[error("Duplicate identifier '{id}' in collection '{collection}'")]
    Duplicate { collection: String, id: String },

    #[error("Invalid collection name '{0}'")]
    InvalidCollection(String),

    #[error("Failed to {1} collection '{2}':\n{0}")]
    Io(#[source] io::Error, &'static str, String),

    #[error("Malformed document in collection '{0}':\n{1}")]
    Malformed(String, #[source] serde_json::Error),
}

impl StoreError {
    /// If this is a connection level failure rather than a failure of a single collection.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// If this failure is a duplicate identifier.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}
