//! Tests for the catalog
//!

use std::path::PathBuf;

use backup_engine::{
    catalog::{
        Catalog, CatalogError, INTERRUPTED_BACKUP, INTERRUPTED_RESTORE, ListQuery, SortField,
        SortOrder,
    },
    record::{BackupRecord, BackupStatus, BackupType, Completion, RestoreRecord, RestoreStatus},
    restore::RestoreOptions,
};
use chrono::{TimeDelta, Utc};

fn record(name: &str, minutes_ago: i64, backup_type: BackupType) -> BackupRecord {
    let created = Utc::now() - TimeDelta::minutes(minutes_ago);
    BackupRecord::new(
        BackupRecord::generate_id(created),
        name.to_string(),
        backup_type,
        None,
        "admin@example.com".to_string(),
        7,
        created,
    )
}

fn complete(catalog: &Catalog, id: &str, size: u64) {
    catalog.update(id, BackupRecord::start).unwrap();
    catalog
        .update(id, |record| {
            let finished = record.start_time() + TimeDelta::seconds(i64::try_from(size).unwrap());
            record.complete(
                Completion {
                    collections: Vec::new(),
                    backup_size: size,
                    compression_ratio: 10.0,
                    checksum: "abc".to_string(),
                    file_path: PathBuf::from(format!("{id}.tar.gz")),
                    cloud_path: None,
                },
                finished,
            )
        })
        .unwrap();
}

#[test]
fn records_survive_reload() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("nested").join("catalog.json");

    let id = {
        let catalog = Catalog::load_or_create(path.clone()).unwrap();
        let record = record("reload", 0, BackupType::Manual);
        let id = record.id().to_string();
        catalog.insert(record).unwrap();
        complete(&catalog, &id, 42);
        id
    };

    let catalog = Catalog::load_or_create(path).unwrap();
    let record = catalog.get(&id).unwrap().unwrap();
    assert_eq!(record.status(), BackupStatus::Completed);
    assert_eq!(record.backup_size(), Some(42));
}

#[test]
fn interrupted_records_fail_on_reload() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("catalog.json");

    let (pending, running, finished, restore) = {
        let catalog = Catalog::load_or_create(path.clone()).unwrap();

        let pending = record("pending", 2, BackupType::Manual);
        let pending_id = pending.id().to_string();
        catalog.insert(pending).unwrap();

        let running = record("running", 1, BackupType::Automatic);
        let running_id = running.id().to_string();
        catalog.insert(running).unwrap();
        catalog.update(&running_id, BackupRecord::start).unwrap();

        let finished = record("finished", 0, BackupType::Manual);
        let finished_id = finished.id().to_string();
        catalog.insert(finished).unwrap();
        complete(&catalog, &finished_id, 10);

        let restore = RestoreRecord::new(
            finished_id.clone(),
            "admin@example.com".to_string(),
            RestoreOptions::default(),
            Utc::now(),
        );
        let restore_id = restore.id.clone();
        catalog.insert_restore(restore).unwrap();
        catalog.update_restore(&restore_id, RestoreRecord::start).unwrap();

        (pending_id, running_id, finished_id, restore_id)
    };

    let catalog = Catalog::load_or_create(path.clone()).unwrap();

    for id in [&pending, &running] {
        let record = catalog.get(id).unwrap().unwrap();
        assert_eq!(record.status(), BackupStatus::Failed);
        assert_eq!(record.error_message(), Some(INTERRUPTED_BACKUP));
        assert!(record.end_time().is_some());
    }
    assert_eq!(
        catalog.get(&finished).unwrap().unwrap().status(),
        BackupStatus::Completed
    );

    let restore = catalog.get_restore(&restore).unwrap().unwrap();
    assert_eq!(restore.status, RestoreStatus::Failed);
    assert_eq!(restore.error_message.as_deref(), Some(INTERRUPTED_RESTORE));

    // The change was written back, a further reload sees the same state.
    drop(catalog);
    let catalog = Catalog::load_or_create(path).unwrap();
    assert_eq!(
        catalog.get(&running).unwrap().unwrap().status(),
        BackupStatus::Failed
    );
}

#[test]
fn duplicate_and_missing_ids() {
    let directory = tempfile::tempdir().unwrap();
    let catalog = Catalog::load_or_create(directory.path().join("catalog.json")).unwrap();

    let record = record("duplicate", 0, BackupType::Manual);
    catalog.insert(record.clone()).unwrap();
    assert!(matches!(
        catalog.insert(record),
        Err(CatalogError::Duplicate(_))
    ));

    assert!(matches!(
        catalog.update("missing", BackupRecord::start),
        Err(CatalogError::NotFound(_))
    ));
    assert!(catalog.remove("missing").unwrap().is_none());
}

#[test]
fn rejected_transition_leaves_record_untouched() {
    let directory = tempfile::tempdir().unwrap();
    let catalog = Catalog::load_or_create(directory.path().join("catalog.json")).unwrap();

    let record = record("rejected", 0, BackupType::Manual);
    let id = record.id().to_string();
    catalog.insert(record).unwrap();
    catalog
        .update(&id, |record| record.fail("boom".to_string(), Utc::now()))
        .unwrap();

    let result = catalog.update(&id, BackupRecord::start);
    assert!(matches!(result, Err(CatalogError::Transition(_))));

    let record = catalog.get(&id).unwrap().unwrap();
    assert_eq!(record.status(), BackupStatus::Failed);
    assert_eq!(record.error_message(), Some("boom"));
}

#[test]
fn list_filters_sorts_and_paginates() {
    let directory = tempfile::tempdir().unwrap();
    let catalog = Catalog::load_or_create(directory.path().join("catalog.json")).unwrap();

    let mut ids = Vec::new();
    for (index, size) in [30_u64, 10, 20, 50, 40].into_iter().enumerate() {
        let backup_type = if index % 2 == 0 {
            BackupType::Manual
        } else {
            BackupType::Automatic
        };
        let record = record(&format!("backup {index}"), i64::try_from(index).unwrap(), backup_type);
        let id = record.id().to_string();
        catalog.insert(record).unwrap();
        complete(&catalog, &id, size);
        ids.push(id);
    }
    // One backup still pending.
    catalog
        .insert(record("pending", 10, BackupType::Manual))
        .unwrap();

    // Newest first by default.
    let page = catalog.list(&ListQuery::default()).unwrap();
    assert_eq!(page.total, 6);
    assert_eq!(page.total_pages, 1);
    assert!(!page.has_next && !page.has_prev);
    assert_eq!(page.items.first().unwrap().id(), ids.first().unwrap());

    let completed = catalog
        .list(&ListQuery {
            status: Some(BackupStatus::Completed),
            sort_by: SortField::BackupSize,
            order: SortOrder::Asc,
            limit: 2,
            page: 2,
            ..ListQuery::default()
        })
        .unwrap();
    assert_eq!(completed.total, 5);
    assert_eq!(completed.total_pages, 3);
    assert_eq!(completed.current_page, 2);
    assert!(completed.has_next && completed.has_prev);
    let sizes: Vec<_> = completed
        .items
        .iter()
        .map(|record| record.backup_size().unwrap())
        .collect();
    assert_eq!(sizes, vec![30, 40]);

    let automatic = catalog
        .list(&ListQuery {
            backup_type: Some(BackupType::Automatic),
            sort_by: SortField::Duration,
            order: SortOrder::Desc,
            ..ListQuery::default()
        })
        .unwrap();
    let durations: Vec<_> = automatic
        .items
        .iter()
        .map(|record| record.duration_ms().unwrap())
        .collect();
    assert_eq!(durations, vec![50_000, 10_000]);
}

#[test]
fn expired_uses_auto_delete_at() {
    let directory = tempfile::tempdir().unwrap();
    let catalog = Catalog::load_or_create(directory.path().join("catalog.json")).unwrap();

    let old = record("old", 60 * 24 * 8, BackupType::Manual);
    let old_id = old.id().to_string();
    catalog.insert(old).unwrap();
    catalog.insert(record("new", 0, BackupType::Manual)).unwrap();

    let expired = catalog.expired(Utc::now()).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired.first().unwrap().id(), old_id);
}
