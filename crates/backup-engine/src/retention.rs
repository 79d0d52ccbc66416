//! Expiring backups past their retention.
//!

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    Context,
    archive_store::{ArchiveStore, ArchiveStoreError},
    catalog::{Catalog, CatalogError},
    record::BackupRecord,
};

/// The outcome of a cleanup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    /// The backups that were deleted.
    pub deleted: Vec<String>,

    /// The backups that could not be deleted.
    pub failed: Vec<String>,

    /// Expired backups left alone because they are still running.
    pub running: Vec<String>,
}

/// Delete a backup's archive and its record.
///
/// Both deletions are always attempted, any failure is returned once both have run.
pub fn delete_backup(
    context: &Context,
    catalog: &Catalog,
    archives: &ArchiveStore,
    record: &BackupRecord,
) -> Result<(), DeleteBackupError> {
    let file_result = archives.delete(record.file_path(), record.cloud_path());
    if let Err(error) = &file_result {
        error!("{context}Could not delete the archive of {}: {error}", record.id());
    }

    let record_result = catalog.remove(record.id());
    if let Err(error) = &record_result {
        error!("{context}Could not delete the record of {}: {error}", record.id());
    }

    match (file_result, record_result) {
        (Ok(()), Ok(_)) => Ok(()),
        (Err(file), Ok(_)) => Err(DeleteBackupError::File(file)),
        (Ok(()), Err(record)) => Err(DeleteBackupError::Record(record)),
        (Err(file), Err(record)) => Err(DeleteBackupError::Both(file, record)),
    }
}

/// Delete every backup whose retention has run out.
///
/// Backups that are still running are skipped until they finish, so running this twice in a row
/// without new expirations does nothing the second time.
pub fn purge_expired(
    context: &mut Context,
    catalog: &Catalog,
    archives: &ArchiveStore,
    now: DateTime<Utc>,
) -> Result<CleanupSummary, CatalogError> {
    context.current_context = "Cleanup";

    let expired = catalog.expired(now)?;
    let mut summary = CleanupSummary::default();

    for record in expired {
        if !record.status().is_terminal() {
            warn!(
                "{context}Backup {} expired while {}, leaving it until it finishes",
                record.id(),
                record.status()
            );
            summary.running.push(record.id().to_string());
            continue;
        }

        match delete_backup(context, catalog, archives, &record) {
            Ok(()) => summary.deleted.push(record.id().to_string()),
            Err(_) => summary.failed.push(record.id().to_string()),
        }
    }

    info!(
        "{context}Deleted {} expired backups, {} failed",
        summary.deleted.len(),
        summary.failed.len()
    );

    Ok(summary)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DeleteBackupError {
    #[error("Failed to delete the archive:\n{0}")]
    File(#[source] ArchiveStoreError),

    #[error("Failed to delete the record:\n{0}")]
    Record(#[source] CatalogError),

    #[error("Failed to delete the archive:\n{0}\nFailed to delete the record:\n{1}")]
    Both(ArchiveStoreError, CatalogError),
}
