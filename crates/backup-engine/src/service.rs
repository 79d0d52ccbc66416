//! The operations exposed to an API layer.
//!
//! Backup and restore runs are blocking work. They run on tokio's blocking pool, bounded by the
//! configured timeout. A run that times out is marked failed, and the record then refuses the
//! late result.
//!

use core::time::Duration;
use std::{
    fs::File,
    io,
    path::PathBuf,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::Tier;
use thiserror::Error;
use tokio::{
    task::{self, JoinError},
    time,
};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::{
    Context,
    archive::ARCHIVE_EXTENSION,
    archive_store::ArchiveStore,
    catalog::{Catalog, CatalogError, ListQuery, Page},
    checksum::{Verification, verify},
    config::{Config, RetentionConfig},
    notify::{Notification, Notifier, notify_or_warn},
    pipeline::{Pipeline, PipelineError},
    record::{BackupRecord, BackupStatus, BackupType, RestoreRecord},
    restore::{IdentifierFields, RestoreAudit, RestoreError, RestoreOptions, RestoreReport, restore},
    retention::{CleanupSummary, DeleteBackupError, delete_backup, purge_expired},
    size::{format_duration, format_file_size},
    store::DocumentStore,
};

/// The largest page a listing may request.
pub const MAX_PAGE_SIZE: u64 = 100;

/// Settings of the service, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Where temporary export and extraction directories are created.
    pub scratch_directory: PathBuf,

    /// The gzip level, 0 to 9.
    pub compression_level: u32,

    /// How long a single backup or restore may run for.
    pub pipeline_timeout: Duration,

    #[allow(missing_docs)]
    pub retention: RetentionConfig,

    #[allow(missing_docs)]
    pub identifier_fields: IdentifierFields,

    /// Who outcome notifications are addressed to.
    pub notify_email: Option<String>,
}

impl ServiceSettings {
    #[allow(missing_docs)]
    pub fn from_config(config: &Config) -> Self {
        Self {
            scratch_directory: config.scratch_directory.clone(),
            compression_level: config.compression_level,
            pipeline_timeout: Duration::from_secs(config.pipeline_timeout_seconds),
            retention: config.retention.clone(),
            identifier_fields: config.identifier_fields.clone(),
            notify_email: config.notify_email.clone(),
        }
    }
}

/// A backup as shown in listings.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub id: String,
    pub name: String,
    pub backup_type: BackupType,
    pub tier: Option<Tier>,
    pub status: BackupStatus,
    pub created_by: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub formatted_duration: String,
    pub backup_size: Option<u64>,
    pub formatted_size: String,
    pub collection_count: usize,
    pub is_verified: bool,
    pub auto_delete_at: DateTime<Utc>,
    pub error_message: Option<String>,
    /// If the archive is still on disk.
    pub can_download: bool,
}

impl From<BackupRecord> for BackupSummary {
    fn from(record: BackupRecord) -> Self {
        Self {
            can_download: record.file_path().is_some_and(|path| path.is_file()),
            formatted_duration: format_duration(record.duration_ms()),
            formatted_size: format_file_size(record.backup_size().unwrap_or(0)),
            collection_count: record.collections().len(),
            id: record.id().to_string(),
            name: record.name().to_string(),
            backup_type: record.backup_type(),
            tier: record.tier(),
            status: record.status(),
            created_by: record.created_by().to_string(),
            start_time: record.start_time(),
            end_time: record.end_time(),
            duration_ms: record.duration_ms(),
            backup_size: record.backup_size(),
            is_verified: record.is_verified(),
            auto_delete_at: record.auto_delete_at(),
            error_message: record.error_message().map(str::to_string),
        }
    }
}

/// A backup with everything known about it.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
pub struct BackupDetail {
    #[serde(flatten)]
    pub record: BackupRecord,
    pub formatted_size: String,
    pub formatted_duration: String,
    /// If the archive is still on disk.
    pub file_exists: bool,
}

/// An archive opened for download.
#[derive(Debug)]
pub struct Download {
    /// The open archive.
    pub file: File,

    /// The suggested file name, `<name>_<id>.tar.gz`.
    pub file_name: String,

    /// The size of the archive in bytes.
    pub size: u64,
}

/// Totals over every backup.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    pub total_backups: u64,
    pub total_size: u64,
    pub formatted_total_size: String,
    pub completed: u64,
    pub failed: u64,
    pub manual: u64,
    pub automatic: u64,
    /// The percentage of backups that completed, rounded.
    pub success_rate: u64,
}

#[derive(Debug)]
struct Inner {
    pipeline: Pipeline,
    settings: ServiceSettings,
    notifier: Arc<dyn Notifier>,
    tasks: TaskTracker,
}

/// Creates, lists, verifies, deletes and restores backups.
#[derive(Debug, Clone)]
pub struct BackupService {
    inner: Arc<Inner>,
}

impl BackupService {
    #[allow(missing_docs)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        catalog: Arc<Catalog>,
        archives: ArchiveStore,
        settings: ServiceSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pipeline = Pipeline {
            store,
            catalog,
            archives,
            scratch_directory: settings.scratch_directory.clone(),
            compression_level: settings.compression_level,
        };

        Self {
            inner: Arc::new(Inner {
                pipeline,
                settings,
                notifier,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// The backup and restore records.
    pub fn catalog(&self) -> &Catalog {
        &self.inner.pipeline.catalog
    }

    #[allow(missing_docs)]
    pub fn settings(&self) -> &ServiceSettings {
        &self.inner.settings
    }

    /// Create a manual backup and run it in the background.
    ///
    /// Returns the identifier of the pending backup immediately, poll
    /// [`get_backup_detail`](Self::get_backup_detail) for the outcome. Must be called from within a
    /// tokio runtime.
    pub fn create_manual_backup(
        &self,
        name: &str,
        retention_days: Option<u32>,
        created_by: &str,
    ) -> Result<String, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput("a backup name is required".to_string()));
        }

        let retention_days = retention_days.unwrap_or(self.inner.settings.retention.manual_days);
        if retention_days == 0 {
            return Err(ServiceError::InvalidInput(
                "retention must be at least one day".to_string(),
            ));
        }

        let now = Utc::now();
        let record = BackupRecord::new(
            BackupRecord::generate_id(now),
            name.to_string(),
            BackupType::Manual,
            None,
            created_by.to_string(),
            retention_days,
            now,
        );
        let id = record.id().to_string();
        self.catalog().insert(record)?;
        info!("[{id}] Manual backup '{name}' requested by {created_by}");

        let service = self.clone();
        let task_id = id.clone();
        self.inner.tasks.spawn(async move {
            if let Err(error) = service.run_backup(&task_id, None).await {
                warn!("[{task_id}] Manual backup did not complete: {error}");
            }
        });

        Ok(id)
    }

    /// Create an automatic backup of `tier` and run it to completion.
    pub async fn create_tier_backup(&self, tier: Tier) -> Result<BackupRecord, ServiceError> {
        let now = Utc::now();
        let record = BackupRecord::new(
            BackupRecord::generate_id(now),
            format!("Auto_{tier}_{}", now.format("%Y-%m-%d")),
            BackupType::Automatic,
            Some(tier),
            "system".to_string(),
            self.inner.settings.retention.for_tier(tier),
            now,
        );
        let id = record.id().to_string();
        self.catalog().insert(record)?;

        let result = self.run_backup(&id, Some(tier)).await;

        match self.catalog().get(&id) {
            Ok(Some(record)) => {
                let notification =
                    Notification::for_backup(&record, self.inner.settings.notify_email.clone());
                notify_or_warn(self.inner.notifier.as_ref(), &notification);
            }
            Ok(None) => warn!("[{id}] [{tier}] Backup record disappeared before notifying"),
            Err(error) => warn!("[{id}] [{tier}] Could not read the backup to notify: {error}"),
        }

        result
    }

    async fn run_backup(&self, id: &str, tier: Option<Tier>) -> Result<BackupRecord, ServiceError> {
        let pipeline = self.inner.pipeline.clone();
        let task_id = id.to_string();
        let run = task::spawn_blocking(move || {
            let mut context = Context::new(&task_id, tier);
            pipeline.run(&mut context, &task_id)
        });

        match time::timeout(self.inner.settings.pipeline_timeout, run).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_error)) => {
                error!("[{id}] Backup task failed: {join_error}");
                self.fail_backup(id, join_error.to_string());
                Err(join_error.into())
            }
            Err(_) => {
                let error = ServiceError::TimedOut {
                    operation: "Backup",
                    seconds: self.inner.settings.pipeline_timeout.as_secs(),
                };
                error!("[{id}] {error}");
                self.fail_backup(id, error.to_string());
                Err(error)
            }
        }
    }

    fn fail_backup(&self, id: &str, message: String) {
        if let Err(error) = self
            .catalog()
            .update(id, |record| record.fail(message, Utc::now()))
        {
            warn!("[{id}] Could not mark the backup as failed: {error}");
        }
    }

    /// A filtered, sorted page of backups.
    pub fn list_backups(&self, query: &ListQuery) -> Result<Page<BackupSummary>, ServiceError> {
        if query.page == 0 {
            return Err(ServiceError::InvalidInput("page starts at 1".to_string()));
        }

        if query.limit == 0 || query.limit > MAX_PAGE_SIZE {
            return Err(ServiceError::InvalidInput(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        Ok(self.catalog().list(query)?.map(BackupSummary::from))
    }

    /// Everything known about a backup.
    pub fn get_backup_detail(&self, id: &str) -> Result<BackupDetail, ServiceError> {
        let record = self.get_record(id)?;

        Ok(BackupDetail {
            file_exists: record.file_path().is_some_and(|path| path.is_file()),
            formatted_size: format_file_size(record.backup_size().unwrap_or(0)),
            formatted_duration: format_duration(record.duration_ms()),
            record,
        })
    }

    /// Open a backup's archive for download.
    pub fn download_backup(&self, id: &str) -> Result<Download, ServiceError> {
        let record = self.get_record(id)?;

        let Some(path) = record.file_path().filter(|path| path.is_file()) else {
            return Err(ServiceError::FileMissing(id.to_string()));
        };

        let file = File::open(path).map_err(ServiceError::Open)?;
        let size = file.metadata().map_err(ServiceError::Open)?.len();

        Ok(Download {
            file,
            file_name: format!("{}_{}.{ARCHIVE_EXTENSION}", record.name(), record.id()),
            size,
        })
    }

    /// Recompute a backup's checksum, marking it corrupted if it no longer matches.
    pub async fn verify_backup(&self, id: &str) -> Result<Verification, ServiceError> {
        let record = self.get_record(id)?;

        if !matches!(
            record.status(),
            BackupStatus::Completed | BackupStatus::Corrupted
        ) {
            return Err(ServiceError::InvalidInput(format!(
                "backup {id} is {} and cannot be verified",
                record.status()
            )));
        }

        let verification = task::spawn_blocking(move || verify(&record)).await?;

        let (_, record) = self
            .catalog()
            .update(id, |record| record.apply_verification(verification.verified))?;

        if verification.verified {
            info!("[{id}] {}", verification.message);
        } else {
            warn!("[{id}] Verification failed, backup is {}: {}", record.status(), verification.message);
        }

        Ok(verification)
    }

    /// Delete a backup's archive and record.
    pub fn delete_backup(&self, id: &str) -> Result<(), ServiceError> {
        let record = self.get_record(id)?;

        delete_backup(
            &Context::new(id, record.tier()),
            self.catalog(),
            &self.inner.pipeline.archives,
            &record,
        )?;
        info!("[{id}] Backup deleted");

        Ok(())
    }

    /// Restore a backup and wait for the report.
    ///
    /// `confirm` must be set, restoring overwrites data.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        options: RestoreOptions,
        confirm: bool,
        requested_by: &str,
    ) -> Result<RestoreReport, ServiceError> {
        let (restore_id, archive_path) =
            self.prepare_restore(backup_id, &options, confirm, requested_by)?;

        self.execute_restore(restore_id, archive_path, options, requested_by.to_string())
            .await
    }

    /// Start restoring a backup in the background, returning the restore's identifier.
    ///
    /// Poll [`get_restore`](Self::get_restore) for the outcome. Must be called from within a tokio
    /// runtime.
    pub fn start_restore(
        &self,
        backup_id: &str,
        options: RestoreOptions,
        confirm: bool,
        requested_by: &str,
    ) -> Result<String, ServiceError> {
        let (restore_id, archive_path) =
            self.prepare_restore(backup_id, &options, confirm, requested_by)?;

        let service = self.clone();
        let task_id = restore_id.clone();
        let requested_by = requested_by.to_string();
        self.inner.tasks.spawn(async move {
            if let Err(error) = service
                .execute_restore(task_id.clone(), archive_path, options, requested_by)
                .await
            {
                warn!("[{task_id}] Restore did not complete: {error}");
            }
        });

        Ok(restore_id)
    }

    /// A restore attempt.
    pub fn get_restore(&self, id: &str) -> Result<RestoreRecord, ServiceError> {
        self.catalog()
            .get_restore(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Check every precondition of a restore and record the attempt.
    fn prepare_restore(
        &self,
        backup_id: &str,
        options: &RestoreOptions,
        confirm: bool,
        requested_by: &str,
    ) -> Result<(String, PathBuf), ServiceError> {
        if !confirm {
            return Err(ServiceError::MissingConfirmation);
        }

        let record = self.get_record(backup_id)?;

        let Some(archive_path) = record.file_path().filter(|path| path.is_file()) else {
            return Err(ServiceError::FileMissing(backup_id.to_string()));
        };

        if !record.is_restorable() {
            return Err(ServiceError::NotRestorable {
                id: backup_id.to_string(),
                status: record.status(),
                verified: record.is_verified(),
            });
        }

        let restore = RestoreRecord::new(
            backup_id.to_string(),
            requested_by.to_string(),
            options.clone(),
            Utc::now(),
        );
        let restore_id = restore.id.clone();
        self.catalog().insert_restore(restore)?;
        info!("[{restore_id}] Restore of {backup_id} requested by {requested_by}");

        Ok((restore_id, archive_path.to_path_buf()))
    }

    async fn execute_restore(
        &self,
        restore_id: String,
        archive_path: PathBuf,
        options: RestoreOptions,
        requested_by: String,
    ) -> Result<RestoreReport, ServiceError> {
        self.catalog()
            .update_restore(&restore_id, RestoreRecord::start)?;

        let store = Arc::clone(&self.inner.pipeline.store);
        let scratch_directory = self.inner.settings.scratch_directory.clone();
        let identifiers = self.inner.settings.identifier_fields.clone();
        let task_options = options.clone();
        let task_id = restore_id.clone();
        let run = task::spawn_blocking(move || {
            let mut context = Context::new(&task_id, None);
            restore(
                &mut context,
                store.as_ref(),
                &archive_path,
                &scratch_directory,
                &task_options,
                &identifiers,
            )
        });

        let result = match time::timeout(self.inner.settings.pipeline_timeout, run).await {
            Ok(Ok(Ok(report))) => Ok(report),
            Ok(Ok(Err(error))) => Err(ServiceError::Restore(error)),
            Ok(Err(join_error)) => Err(ServiceError::Join(join_error)),
            Err(_) => Err(ServiceError::TimedOut {
                operation: "Restore",
                seconds: self.inner.settings.pipeline_timeout.as_secs(),
            }),
        };

        match result {
            Ok(mut report) => {
                report.audit = Some(RestoreAudit {
                    restored_by: requested_by,
                    options,
                });

                if let Err(error) = self
                    .catalog()
                    .update_restore(&restore_id, |record| record.complete(report.clone(), Utc::now()))
                {
                    warn!("[{restore_id}] Could not mark the restore as completed: {error}");
                }

                Ok(report)
            }
            Err(error) => {
                error!("[{restore_id}] {error}");

                let message = error.to_string();
                if let Err(update_error) = self
                    .catalog()
                    .update_restore(&restore_id, |record| record.fail(message, Utc::now()))
                {
                    warn!("[{restore_id}] Could not mark the restore as failed: {update_error}");
                }

                Err(error)
            }
        }
    }

    /// Totals over every backup.
    pub fn get_backup_stats(&self) -> Result<BackupStats, ServiceError> {
        let records = self.catalog().all()?;

        let count = |predicate: &dyn Fn(&BackupRecord) -> bool| -> u64 {
            u64::try_from(records.iter().filter(|record| predicate(record)).count())
                .unwrap_or(u64::MAX)
        };

        let total_backups = u64::try_from(records.len()).unwrap_or(u64::MAX);
        let total_size = records
            .iter()
            .filter_map(BackupRecord::backup_size)
            .sum();
        let completed = count(&|record| record.status() == BackupStatus::Completed);
        let success_rate = if total_backups == 0 {
            0
        } else {
            (completed * 100 + total_backups / 2) / total_backups
        };

        Ok(BackupStats {
            total_backups,
            total_size,
            formatted_total_size: format_file_size(total_size),
            completed,
            failed: count(&|record| record.status() == BackupStatus::Failed),
            manual: count(&|record| record.backup_type() == BackupType::Manual),
            automatic: count(&|record| record.backup_type() != BackupType::Manual),
            success_rate,
        })
    }

    /// Delete every expired backup now.
    pub async fn trigger_cleanup(&self) -> Result<CleanupSummary, ServiceError> {
        let catalog = Arc::clone(&self.inner.pipeline.catalog);
        let archives = self.inner.pipeline.archives.clone();

        let summary = task::spawn_blocking(move || {
            purge_expired(&mut Context::default(), &catalog, &archives, Utc::now())
        })
        .await??;

        Ok(summary)
    }

    /// The most recent completed backup of a tier.
    pub fn last_tier_backup(&self, tier: Tier) -> Result<Option<BackupRecord>, ServiceError> {
        Ok(self.catalog().last_completed(tier)?)
    }

    /// Wait for every background backup and restore to finish.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    fn get_record(&self, id: &str) -> Result<BackupRecord, ServiceError> {
        self.catalog()
            .get(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Backup or restore '{0}' not found")]
    NotFound(String),

    #[error("Restore requires explicit confirmation")]
    MissingConfirmation,

    #[error("Backup '{id}' cannot be restored, it is {status} (verified: {verified})")]
    NotRestorable {
        id: String,
        status: BackupStatus,
        verified: bool,
    },

    #[error("The archive of backup '{0}' is missing")]
    FileMissing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{operation} timed out after {seconds}s")]
    TimedOut {
        operation: &'static str,
        seconds: u64,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Delete(#[from] DeleteBackupError),

    #[error("Failed to open the archive:\n{0}")]
    Open(#[source] io::Error),

    #[error("Background task failed:\n{0}")]
    Join(#[from] JoinError),
}
