use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{Mutex, RwLock, RwLockWriteGuard},
};

use serde_json::Value;

use crate::object_id::ObjectId;

use super::{
    Document, DocumentCursor, DocumentFailure, DocumentStore, ID_FIELD, InsertManyOutcome,
    StoreError, UpsertOutcome, document_id, id_key,
};

/// A collection, documents in insertion order with an index over their identifiers.
#[derive(Debug, Default, Clone)]
struct Collection {
    documents: Vec<Document>,
    index: BTreeMap<String, usize>,
}

/// An in-process document store.
///
/// Supports fault injection so callers can exercise unreachable stores, unreadable collections
/// and collections that cannot be dropped.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    collections: RwLock<BTreeMap<String, Collection>>,
    available: AtomicBool,
    failing_reads: Mutex<BTreeSet<String>>,
    failing_drops: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            collections: RwLock::default(),
            available: AtomicBool::new(true),
            failing_reads: Mutex::default(),
            failing_drops: Mutex::default(),
        }
    }

    /// Create a collection if it does not exist.
    pub fn create_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.write()?.entry(collection.to_string()).or_default();
        Ok(())
    }

    /// Mark the whole store as reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every read of `collection` fail.
    pub fn fail_reads(&self, collection: &str) {
        if let Ok(mut failing) = self.failing_reads.lock() {
            failing.insert(collection.to_string());
        }
    }

    /// Make every drop of `collection` fail.
    pub fn fail_drops(&self, collection: &str) {
        if let Ok(mut failing) = self.failing_drops.lock() {
            failing.insert(collection.to_string());
        }
    }

    /// The documents of a collection, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .ok()
            .and_then(|collections| {
                collections
                    .get(collection)
                    .map(|collection| collection.documents.clone())
            })
            .unwrap_or_default()
    }

    /// The number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .ok()
            .and_then(|collections| collections.get(collection).map(|c| c.documents.len()))
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "could not reach database '{}'",
                self.name
            )))
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Collection>>, StoreError> {
        self.check_available()?;
        self.collections
            .write()
            .map_err(|_| StoreError::Unavailable("collection lock poisoned".to_string()))
    }
}

/// Give a document an identifier if it has none, as the store would on insert.
fn ensure_id(document: &mut Document) -> Value {
    document
        .entry(ID_FIELD)
        .or_insert_with(|| ObjectId::new().to_value())
        .clone()
}

fn insert(
    collection_name: &str,
    collection: &mut Collection,
    mut document: Document,
) -> Result<(), StoreError> {
    let key = id_key(&ensure_id(&mut document));

    if collection.index.contains_key(&key) {
        return Err(StoreError::Duplicate {
            collection: collection_name.to_string(),
            id: document_id(&document).unwrap_or_default(),
        });
    }

    collection.index.insert(key, collection.documents.len());
    collection.documents.push(document);

    Ok(())
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.check_available()?;

        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::Unavailable("collection lock poisoned".to_string()))?;

        Ok(collections.keys().cloned().collect())
    }

    fn read_all(&self, collection: &str) -> Result<DocumentCursor<'_>, StoreError> {
        self.check_available()?;

        let failing = self
            .failing_reads
            .lock()
            .map(|failing| failing.contains(collection))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Io(
                io::Error::other("injected read failure"),
                "read",
                collection.to_string(),
            ));
        }

        let documents = self.documents(collection);
        Ok(Box::new(documents.into_iter().map(Ok)))
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let mut collections = self.write()?;
        let entry = collections.entry(collection.to_string()).or_default();

        insert(collection, entry, document)
    }

    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertManyOutcome, StoreError> {
        let mut collections = self.write()?;
        let entry = collections.entry(collection.to_string()).or_default();

        let mut outcome = InsertManyOutcome::default();
        for document in documents {
            let id = document_id(&document);
            match insert(collection, entry, document) {
                Ok(()) => outcome.inserted += 1,
                Err(error) => outcome.failures.push(DocumentFailure { id, error }),
            }
        }

        Ok(outcome)
    }

    fn upsert(&self, collection: &str, mut document: Document) -> Result<UpsertOutcome, StoreError> {
        let mut collections = self.write()?;
        let entry = collections.entry(collection.to_string()).or_default();

        let key = id_key(&ensure_id(&mut document));
        match entry.index.get(&key).copied() {
            Some(position) => {
                if let Some(existing) = entry.documents.get_mut(position) {
                    *existing = document;
                }
                Ok(UpsertOutcome::Updated)
            }
            None => {
                insert(collection, entry, document)?;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn drop_collection(&self, collection: &str) -> Result<bool, StoreError> {
        let failing = self
            .failing_drops
            .lock()
            .map(|failing| failing.contains(collection))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Io(
                io::Error::other("permission denied"),
                "drop",
                collection.to_string(),
            ));
        }

        Ok(self.write()?.remove(collection).is_some())
    }
}
