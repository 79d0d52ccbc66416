//! Tests for the scheduler
//!

use core::time::Duration;
use std::sync::Arc;

use backup_engine::{
    catalog::Catalog,
    record::{BackupRecord, BackupStatus, BackupType},
    scheduler::{Schedule, ScheduledTask, SchedulerHandle},
    store::{
        Document, DocumentCursor, DocumentStore, InsertManyOutcome, MemoryStore, StoreError,
        UpsertOutcome,
    },
};
use chrono::{TimeDelta, Utc};
use common::{Harness, RecordingNotifier, eventually, seed_users};
use shared::Tier;

mod common;

const HOUR: Duration = Duration::from_secs(60 * 60);

fn tier_backups(harness: &Harness, tier: Tier, status: BackupStatus) -> usize {
    harness
        .catalog
        .all()
        .unwrap()
        .iter()
        .filter(|record| record.tier() == Some(tier) && record.status() == status)
        .count()
}

fn completed_daily_backups(harness: &Harness) -> usize {
    tier_backups(harness, Tier::Daily, BackupStatus::Completed)
}

/// A store that is unreachable whenever a backup of `tier` is running.
#[derive(Debug)]
struct UnreachableForTier {
    inner: Arc<MemoryStore>,
    catalog: Arc<Catalog>,
    tier: Tier,
}

impl DocumentStore for UnreachableForTier {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let running = self.catalog.all().unwrap().iter().any(|record| {
            record.tier() == Some(self.tier) && record.status() == BackupStatus::InProgress
        });
        if running {
            return Err(StoreError::Unavailable(format!("{} backups are refused", self.tier)));
        }

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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enabled_tier_runs_on_its_interval() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    seed_users(&harness.store, 2);

    let scheduler = SchedulerHandle::new(
        harness.service(),
        Schedule {
            daily: Duration::from_millis(200),
            weekly: HOUR,
            monthly: HOUR,
            cleanup: HOUR,
            enabled: vec![Tier::Daily],
        },
    );
    scheduler.start();

    let status = scheduler.status();
    assert!(status.running);
    assert_eq!(
        status.active_tasks,
        vec![ScheduledTask::Backup(Tier::Daily), ScheduledTask::Cleanup]
    );
    assert_eq!(
        scheduler.describe(ScheduledTask::Backup(Tier::Weekly)),
        "weekly backup every hour (stopped)"
    );

    assert!(eventually(|| completed_daily_backups(&harness) >= 2).await);

    scheduler.set_enabled(ScheduledTask::Backup(Tier::Daily), false);
    assert_eq!(
        scheduler.describe(ScheduledTask::Backup(Tier::Daily)),
        "daily backup every 200 milliseconds (stopped)"
    );
    assert_eq!(
        scheduler.status().active_tasks,
        vec![ScheduledTask::Cleanup]
    );

    scheduler.shutdown().await;
    assert!(!scheduler.status().running);

    // Every scheduled backup is automatic and none were weekly or monthly.
    let records = harness.catalog.all().unwrap();
    assert!(
        records
            .iter()
            .all(|record| record.backup_type() == BackupType::Automatic
                && record.tier() == Some(Tier::Daily))
    );
}

#[tokio::test]
async fn recent_backup_delays_the_first_run() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    seed_users(&harness.store, 1);
    let service = harness.service();
    service.create_tier_backup(Tier::Monthly).await.unwrap();

    let scheduler = SchedulerHandle::new(
        service,
        Schedule {
            daily: HOUR,
            weekly: HOUR,
            monthly: HOUR,
            cleanup: HOUR,
            enabled: vec![Tier::Monthly],
        },
    );
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.shutdown().await;

    // The monthly backup taken a moment ago is recent enough.
    assert_eq!(harness.catalog.all().unwrap().len(), 1);
}

#[tokio::test]
async fn zero_interval_is_not_scheduled() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    let scheduler = SchedulerHandle::new(
        harness.service(),
        Schedule {
            daily: Duration::ZERO,
            weekly: HOUR,
            monthly: HOUR,
            cleanup: Duration::ZERO,
            enabled: vec![Tier::Daily],
        },
    );
    scheduler.start();

    assert!(!scheduler.status().running);
    scheduler.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_tier_does_not_stop_the_others() {
    let _logger = shared::test::init_test_logger();

    let harness = Harness::new();
    seed_users(&harness.store, 2);

    let store = UnreachableForTier {
        inner: Arc::clone(&harness.store),
        catalog: Arc::clone(&harness.catalog),
        tier: Tier::Weekly,
    };
    let service = harness.service_with(
        Arc::new(store),
        harness.settings(),
        Arc::new(RecordingNotifier::default()),
    );

    let scheduler = SchedulerHandle::new(
        service,
        Schedule {
            daily: Duration::from_millis(150),
            weekly: Duration::from_millis(350),
            monthly: HOUR,
            cleanup: Duration::from_millis(150),
            enabled: vec![Tier::Daily, Tier::Weekly],
        },
    );
    scheduler.start();

    assert!(eventually(|| tier_backups(&harness, Tier::Weekly, BackupStatus::Failed) >= 2).await);
    assert!(eventually(|| completed_daily_backups(&harness) >= 2).await);

    // An expired backup added after the failures is still cleaned up.
    let created = Utc::now() - TimeDelta::days(3);
    let expired = BackupRecord::new(
        BackupRecord::generate_id(created),
        "expired".to_string(),
        BackupType::Manual,
        None,
        "admin@example.com".to_string(),
        1,
        created,
    );
    let expired_id = expired.id().to_string();
    harness.catalog.insert(expired).unwrap();
    harness
        .catalog
        .update(&expired_id, |record| record.fail("export failed".to_string(), created))
        .unwrap();
    assert!(eventually(|| harness.catalog.get(&expired_id).unwrap().is_none()).await);

    assert_eq!(
        scheduler.status().active_tasks,
        vec![
            ScheduledTask::Backup(Tier::Daily),
            ScheduledTask::Backup(Tier::Weekly),
            ScheduledTask::Cleanup
        ]
    );
    scheduler.shutdown().await;

    assert_eq!(tier_backups(&harness, Tier::Weekly, BackupStatus::Completed), 0);
}
