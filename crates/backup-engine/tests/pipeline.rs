//! Tests for a full backup run
//!

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
};

use backup_engine::{
    Context,
    archive_store::DirectoryMirror,
    catalog::{Catalog, CatalogError, INTERRUPTED_BACKUP},
    checksum::{checksum, verify},
    pipeline::{Pipeline, PipelineError},
    record::BackupStatus,
    restore::{ConflictResolution, RestoreOptions, restore},
    store::{
        Document, DocumentCursor, DocumentStore, InsertManyOutcome, MemoryStore, StoreError,
        UpsertOutcome,
    },
};
use chrono::TimeDelta;
use common::{FlakyMirror, Harness, identifier_fields, seed_users};

mod common;

#[test]
fn nightly_backup_end_to_end() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    seed_users(&harness.store, 3);
    harness.store.create_collection("orders").unwrap();

    let id = harness.pending_backup("nightly-test", 1);
    let record = harness
        .pipeline()
        .run(&mut Context::new(&id, None), &id)
        .unwrap();

    assert_eq!(record.status(), BackupStatus::Completed);
    assert!(record.is_verified());
    assert!(record.end_time().unwrap() >= record.start_time());
    assert!(record.duration_ms().unwrap() >= 0);
    assert_eq!(record.auto_delete_at(), record.start_time() + TimeDelta::days(1));

    let users = record
        .collections()
        .iter()
        .find(|collection| collection.name == "users")
        .unwrap();
    assert_eq!(users.document_count, 3);
    let orders = record
        .collections()
        .iter()
        .find(|collection| collection.name == "orders")
        .unwrap();
    assert_eq!(orders.document_count, 0);

    // The archive landed in the backup directory and matches its checksum.
    let archive = record.file_path().unwrap();
    assert!(archive.starts_with(harness.backups()));
    assert_eq!(record.backup_size(), Some(fs::metadata(archive).unwrap().len()));
    assert_eq!(record.checksum().unwrap(), checksum(archive).unwrap());
    assert_eq!(harness.scratch_entries(), 0);

    // The catalog holds the same record.
    assert_eq!(harness.catalog.get(&id).unwrap().unwrap(), record);

    // Restoring into the unchanged store skips every document.
    let report = restore(
        &mut Context::default(),
        harness.store.as_ref(),
        archive,
        &harness.scratch(),
        &RestoreOptions {
            drop_existing: false,
            conflict_resolution: ConflictResolution::Skip,
            collections: None,
        },
        &identifier_fields(),
    )
    .unwrap();
    assert_eq!(report.stats.inserted_documents, 0);
    assert_eq!(report.stats.skipped_documents, 3);
    assert_eq!(harness.store.count("users"), 3);

    // Tampering is caught by verification.
    let mut bytes = fs::read(archive).unwrap();
    if let Some(byte) = bytes.last_mut() {
        *byte ^= 0xff;
    }
    fs::write(archive, bytes).unwrap();

    let verification = verify(&record);
    assert!(!verification.verified);
    let (_, corrupted) = harness
        .catalog
        .update(&id, |record| record.apply_verification(verification.verified))
        .unwrap();
    assert_eq!(corrupted.status(), BackupStatus::Corrupted);
    assert!(!corrupted.is_restorable());
}

#[test]
fn unreachable_store_fails_the_backup() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    seed_users(&harness.store, 2);
    harness.store.set_available(false);

    let id = harness.pending_backup("unreachable", 7);
    let result = harness.pipeline().run(&mut Context::new(&id, None), &id);
    assert!(matches!(result, Err(PipelineError::Export(_))));

    let record = harness.catalog.get(&id).unwrap().unwrap();
    assert_eq!(record.status(), BackupStatus::Failed);
    assert!(record.error_message().is_some());
    assert!(record.end_time().is_some());
    assert!(record.file_path().is_none());
    assert!(record.checksum().is_none());

    assert_eq!(fs::read_dir(harness.backups()).unwrap().count(), 0);
    assert_eq!(harness.scratch_entries(), 0);
}

#[test]
fn only_pending_backups_can_run() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    seed_users(&harness.store, 1);
    let record = harness.completed_backup("once");

    let result = harness
        .pipeline()
        .run(&mut Context::new(record.id(), None), record.id());
    assert!(matches!(result, Err(PipelineError::Catalog(_))));

    // The completed record is untouched.
    assert_eq!(harness.catalog.get(record.id()).unwrap().unwrap(), record);
    assert_eq!(fs::read_dir(harness.backups()).unwrap().count(), 1);
}

#[test]
fn failed_mirror_upload_still_completes() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    let mirror = Arc::new(FlakyMirror {
        inner: DirectoryMirror::new(harness.mirror_directory()),
        fail_uploads: true,
        fail_deletes: false,
    });
    let harness = harness.mirrored(mirror);
    seed_users(&harness.store, 2);

    let record = harness.completed_backup("local only");

    assert_eq!(record.status(), BackupStatus::Completed);
    assert!(record.is_verified());
    assert_eq!(record.cloud_path(), None);
    assert!(record.file_path().unwrap().exists());
    assert!(!harness.mirror_directory().exists());
}

/// Delegates to a memory store, but blocks the catalog's next save once the export starts.
#[derive(Debug)]
struct BlockCatalogSaves {
    inner: MemoryStore,
    blocked: PathBuf,
}

impl DocumentStore for BlockCatalogSaves {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        // Writing the temporary catalog file fails while a directory occupies its path.
        fs::create_dir_all(&self.blocked).unwrap();
        self.inner.list_collections()
    }

    fn read_all(&self, collection: &str) -> Result<DocumentCursor<'_>, StoreError> {
        self.inner.read_all(collection)
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.inner.insert_one(collection, document)
    }

    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertManyOutcome, StoreError> {
        self.inner.insert_many(collection, documents)
    }

    fn upsert(&self, collection: &str, document: Document) -> Result<UpsertOutcome, StoreError> {
        self.inner.upsert(collection, document)
    }

    fn drop_collection(&self, collection: &str) -> Result<bool, StoreError> {
        self.inner.drop_collection(collection)
    }
}

#[test]
fn unsaved_completion_discards_the_archive() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    let blocked = harness.catalog.path().with_extension("json.tmp");

    let inner = MemoryStore::new("clinic");
    seed_users(&inner, 2);
    let pipeline = Pipeline {
        store: Arc::new(BlockCatalogSaves {
            inner,
            blocked: blocked.clone(),
        }),
        ..harness.pipeline()
    };

    let id = harness.pending_backup("unsaved", 7);
    let result = pipeline.run(&mut Context::new(&id, None), &id);
    assert!(matches!(
        result,
        Err(PipelineError::Catalog(CatalogError::Io(..)))
    ));

    // Neither the completion nor the failure could be saved, and the archive was discarded.
    assert_eq!(fs::read_dir(harness.backups()).unwrap().count(), 0);
    assert_eq!(harness.scratch_entries(), 0);
    assert_eq!(
        harness.catalog.get(&id).unwrap().unwrap().status(),
        BackupStatus::InProgress
    );

    // Once saving works again the next load fails the stranded record.
    fs::remove_dir(&blocked).unwrap();
    let catalog = Catalog::load_or_create(harness.catalog.path().to_path_buf()).unwrap();
    let record = catalog.get(&id).unwrap().unwrap();
    assert_eq!(record.status(), BackupStatus::Failed);
    assert_eq!(record.error_message(), Some(INTERRUPTED_BACKUP));
}
