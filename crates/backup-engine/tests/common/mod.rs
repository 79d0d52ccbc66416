//! # common
//!

#![allow(dead_code)]

use core::time::Duration;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use backup_engine::{
    BackupService, ServiceSettings,
    archive_store::{ArchiveStore, DirectoryMirror, ObjectStore, ObjectStoreError},
    catalog::Catalog,
    config::RetentionConfig,
    notify::{Notification, Notifier, NotifyError},
    object_id::ObjectId,
    pipeline::Pipeline,
    record::{BackupRecord, BackupType},
    restore::IdentifierFields,
    store::{Document, DocumentStore, MemoryStore},
};
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Isolated directories and stores for a single test.
pub struct Harness {
    pub directory: TempDir,
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<Catalog>,
    pub archives: ArchiveStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new("clinic"))
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let directory = tempfile::tempdir().unwrap();

        let catalog = Catalog::load_or_create(directory.path().join("catalog.json")).unwrap();
        let archives = ArchiveStore::new(directory.path().join("backups"), None).unwrap();

        Self {
            directory,
            store: Arc::new(store),
            catalog: Arc::new(catalog),
            archives,
        }
    }

    /// Mirror archives through `mirror`.
    pub fn mirrored(mut self, mirror: Arc<dyn ObjectStore>) -> Self {
        self.archives =
            ArchiveStore::new(self.directory.path().join("backups"), Some(mirror)).unwrap();
        self
    }

    pub fn mirror_directory(&self) -> PathBuf {
        self.directory.path().join("mirror")
    }

    pub fn scratch(&self) -> PathBuf {
        self.directory.path().join("scratch")
    }

    pub fn backups(&self) -> &Path {
        self.archives.directory()
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            store: Arc::clone(&self.store) as Arc<dyn DocumentStore>,
            catalog: Arc::clone(&self.catalog),
            archives: self.archives.clone(),
            scratch_directory: self.scratch(),
            compression_level: 6,
        }
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            scratch_directory: self.scratch(),
            compression_level: 6,
            pipeline_timeout: Duration::from_secs(30),
            retention: RetentionConfig::default(),
            identifier_fields: identifier_fields(),
            notify_email: Some("admin@example.com".to_string()),
        }
    }

    pub fn service(&self) -> BackupService {
        self.service_with(
            Arc::clone(&self.store) as Arc<dyn DocumentStore>,
            self.settings(),
            Arc::new(RecordingNotifier::default()),
        )
    }

    pub fn service_with(
        &self,
        store: Arc<dyn DocumentStore>,
        settings: ServiceSettings,
        notifier: Arc<dyn Notifier>,
    ) -> BackupService {
        BackupService::new(
            store,
            Arc::clone(&self.catalog),
            self.archives.clone(),
            settings,
            notifier,
        )
    }

    /// Insert a pending manual backup into the catalog.
    pub fn pending_backup(&self, name: &str, retention_days: u32) -> String {
        let now = Utc::now();
        let record = BackupRecord::new(
            BackupRecord::generate_id(now),
            name.to_string(),
            BackupType::Manual,
            None,
            "admin@example.com".to_string(),
            retention_days,
            now,
        );
        let id = record.id().to_string();
        self.catalog.insert(record).unwrap();
        id
    }

    /// Run a complete manual backup of the store.
    pub fn completed_backup(&self, name: &str) -> BackupRecord {
        let id = self.pending_backup(name, 7);
        let mut context = backup_engine::Context::new(&id, None);
        self.pipeline().run(&mut context, &id).unwrap()
    }

    /// The number of entries left in the scratch directory.
    pub fn scratch_entries(&self) -> usize {
        match fs::read_dir(self.scratch()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

pub fn identifier_fields() -> IdentifierFields {
    IdentifierFields::new(BTreeMap::from([(
        "orders".to_string(),
        vec!["userId".to_string(), "items.productId".to_string()],
    )]))
}

pub fn document(value: Value) -> Document {
    match value {
        Value::Object(document) => document,
        other => panic!("not a document: {other}"),
    }
}

/// Insert `count` users and return them.
pub fn seed_users(store: &MemoryStore, count: usize) -> Vec<Document> {
    store.create_collection("users").unwrap();

    (0..count)
        .map(|index| {
            let user = document(json!({
                "_id": ObjectId::new().to_value(),
                "name": format!("user {index}"),
                "email": format!("user{index}@example.com"),
                "age": 20 + index,
            }));
            store.insert_one("users", user.clone()).unwrap();
            user
        })
        .collect()
}

/// Insert an order referencing `user` and return it.
pub fn seed_order(store: &MemoryStore, user: &Document) -> Document {
    let product = ObjectId::new().to_value();
    let order = document(json!({
        "_id": ObjectId::new().to_value(),
        "userId": user.get("_id").cloned().unwrap(),
        "items": [{ "productId": product, "quantity": 2 }],
        "total": 19.5,
    }));
    store.insert_one("orders", order.clone()).unwrap();
    order
}

/// Documents of a collection keyed by their serialized form, for set comparisons.
pub fn document_set(documents: &[Document]) -> Vec<String> {
    let mut set: Vec<String> = documents
        .iter()
        .map(|document| serde_json::to_string(document).unwrap())
        .collect();
    set.sort();
    set
}

/// Keeps every notification it is given.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<Notification>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.notifications
            .lock()
            .unwrap()
            .push(notification.clone());
        Ok(())
    }
}

/// A directory mirror whose uploads or deletes can be made to fail.
#[derive(Debug)]
pub struct FlakyMirror {
    pub inner: DirectoryMirror,
    pub fail_uploads: bool,
    pub fail_deletes: bool,
}

impl ObjectStore for FlakyMirror {
    fn upload(&self, path: &Path, key: &str) -> Result<String, ObjectStoreError> {
        if self.fail_uploads {
            return Err(ObjectStoreError::Io(io::Error::other("connection reset")));
        }
        self.inner.upload(path, key)
    }

    fn delete(&self, reference: &str) -> Result<(), ObjectStoreError> {
        if self.fail_deletes {
            return Err(ObjectStoreError::Rejected("access denied".to_string()));
        }
        self.inner.delete(reference)
    }
}

/// Poll until `condition` holds or a few seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
