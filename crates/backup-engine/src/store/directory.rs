use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde_json::Value;

use crate::object_id::ObjectId;

use super::{
    Document, DocumentCursor, DocumentFailure, DocumentStore, ID_FIELD, InsertManyOutcome,
    StoreError, UpsertOutcome, document_id, id_key, is_valid_collection_name,
};

const EXTENSION: &str = "jsonl";

/// A document store kept on disk, one JSON lines file per collection.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryStore {
    /// Open a store rooted at `root`, creating the directory if it does not exist.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_collection_name(collection) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }

        Ok(self.root.join(format!("{collection}.{EXTENSION}")))
    }

    fn check_root(&self) -> Result<(), StoreError> {
        match fs::metadata(&self.root) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::Unavailable(format!(
                "{:?} is not a directory",
                self.root
            ))),
            Err(error) => Err(StoreError::Unavailable(format!(
                "could not access {:?}: {error}",
                self.root
            ))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("write lock poisoned".to_string()))
    }

    /// The identifiers already present in a collection.
    fn existing_ids(&self, collection: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut ids = BTreeSet::new();
        for document in self.read_all(collection)? {
            if let Some(id) = document?.get(ID_FIELD) {
                ids.insert(id_key(id));
            }
        }
        Ok(ids)
    }

    fn append(&self, collection: &str, documents: &[Document]) -> Result<(), StoreError> {
        let path = self.collection_path(collection)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io(e, "open", collection.to_string()))?;

        let mut writer = BufWriter::new(file);
        for document in documents {
            write_line(&mut writer, collection, document)?;
        }
        writer
            .flush()
            .map_err(|e| StoreError::Io(e, "write", collection.to_string()))
    }
}

fn write_line<W: Write>(
    writer: &mut W,
    collection: &str,
    document: &Document,
) -> Result<(), StoreError> {
    serde_json::to_writer(&mut *writer, document)
        .map_err(|e| StoreError::Malformed(collection.to_string(), e))?;
    writer
        .write_all(b"\n")
        .map_err(|e| StoreError::Io(e, "write", collection.to_string()))
}

fn ensure_id(document: &mut Document) -> Value {
    document
        .entry(ID_FIELD)
        .or_insert_with(|| ObjectId::new().to_value())
        .clone()
}

fn read_lines(path: &Path, collection: String) -> Result<DocumentCursor<'static>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Box::new(core::iter::empty())),
        Err(error) => return Err(StoreError::Io(error, "open", collection)),
    };

    let lines = BufReader::new(file).lines().filter_map(move |line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(
            serde_json::from_str::<Document>(&line)
                .map_err(|e| StoreError::Malformed(collection.clone(), e)),
        ),
        Err(error) => Some(Err(StoreError::Io(error, "read", collection.clone()))),
    });

    Ok(Box::new(lines))
}

impl DocumentStore for DirectoryStore {
    fn name(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root.to_string_lossy().to_string())
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.check_root()?;

        let directory =
            fs::read_dir(&self.root).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut collections: Vec<String> = directory
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()? != EXTENSION {
                    return None;
                }
                Some(path.file_stem()?.to_string_lossy().to_string())
            })
            .filter(|name| is_valid_collection_name(name))
            .collect();
        collections.sort();

        Ok(collections)
    }

    fn read_all(&self, collection: &str) -> Result<DocumentCursor<'_>, StoreError> {
        self.check_root()?;
        let path = self.collection_path(collection)?;

        read_lines(&path, collection.to_string())
    }

    fn insert_one(&self, collection: &str, mut document: Document) -> Result<(), StoreError> {
        let _guard = self.lock()?;

        let key = id_key(&ensure_id(&mut document));
        if self.existing_ids(collection)?.contains(&key) {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id: document_id(&document).unwrap_or_default(),
            });
        }

        self.append(collection, &[document])
    }

    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertManyOutcome, StoreError> {
        let _guard = self.lock()?;

        let mut ids = self.existing_ids(collection)?;
        let mut outcome = InsertManyOutcome::default();
        let mut accepted = Vec::with_capacity(documents.len());

        for mut document in documents {
            let key = id_key(&ensure_id(&mut document));
            if ids.insert(key) {
                accepted.push(document);
            } else {
                outcome.failures.push(DocumentFailure {
                    id: document_id(&document),
                    error: StoreError::Duplicate {
                        collection: collection.to_string(),
                        id: document_id(&document).unwrap_or_default(),
                    },
                });
            }
        }

        self.append(collection, &accepted)?;
        outcome.inserted = u64::try_from(accepted.len()).unwrap_or(u64::MAX);

        Ok(outcome)
    }

    fn upsert(&self, collection: &str, mut document: Document) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.lock()?;

        let key = id_key(&ensure_id(&mut document));
        let path = self.collection_path(collection)?;
        let temporary_path = path.with_extension(format!("{EXTENSION}.tmp"));

        // Rewrite the collection with the document replaced, or appended if absent.
        let mut outcome = UpsertOutcome::Inserted;
        {
            let file = File::create(&temporary_path)
                .map_err(|e| StoreError::Io(e, "create", collection.to_string()))?;
            let mut writer = BufWriter::new(file);

            for existing in read_lines(&path, collection.to_string())? {
                let existing = existing?;
                let matches = existing
                    .get(ID_FIELD)
                    .is_some_and(|id| id_key(id) == key);

                if matches && outcome == UpsertOutcome::Inserted {
                    write_line(&mut writer, collection, &document)?;
                    outcome = UpsertOutcome::Updated;
                } else {
                    write_line(&mut writer, collection, &existing)?;
                }
            }

            if outcome == UpsertOutcome::Inserted {
                write_line(&mut writer, collection, &document)?;
            }

            writer
                .flush()
                .map_err(|e| StoreError::Io(e, "write", collection.to_string()))?;
        }

        fs::rename(&temporary_path, &path)
            .map_err(|e| StoreError::Io(e, "replace", collection.to_string()))?;

        Ok(outcome)
    }

    fn drop_collection(&self, collection: &str) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        self.check_root()?;

        match fs::remove_file(self.collection_path(collection)?) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(StoreError::Io(error, "drop", collection.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn document(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_read_upsert_drop() {
        let directory = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(directory.path().join("clinic")).unwrap();

        store
            .insert_one("users", document(json!({ "_id": "a", "name": "Ann" })))
            .unwrap();
        let duplicate = store.insert_one("users", document(json!({ "_id": "a" })));
        assert!(duplicate.unwrap_err().is_duplicate());

        let outcome = store
            .upsert("users", document(json!({ "_id": "a", "name": "Anne" })))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let documents: Vec<_> = store
            .read_all("users")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(documents, vec![document(json!({ "_id": "a", "name": "Anne" }))]);
        assert_eq!(store.list_collections().unwrap(), vec!["users".to_string()]);

        assert!(store.drop_collection("users").unwrap());
        assert!(!store.drop_collection("users").unwrap());
        assert!(store.list_collections().unwrap().is_empty());
    }

    #[test]
    fn rejects_path_like_collection_names() {
        let directory = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(directory.path().to_path_buf()).unwrap();

        let result = store.insert_one("../escape", Document::new());
        assert!(matches!(result, Err(StoreError::InvalidCollection(_))));
    }
}
