//! Drives a single backup from pending to a terminal state.
//!

use std::{
    fs, io,
    path::PathBuf,
    sync::Arc,
};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    Context,
    archive::{ArchiveError, compress},
    archive_store::{ArchiveStore, ArchiveStoreError},
    catalog::{Catalog, CatalogError},
    checksum::{ChecksumError, checksum},
    export::{ExportError, export},
    record::{BackupRecord, Completion},
    size::format_file_size,
    store::DocumentStore,
};

/// Everything a backup run reads from and writes to.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// The store being backed up.
    pub store: Arc<dyn DocumentStore>,
    #[allow(missing_docs)]
    pub catalog: Arc<Catalog>,
    #[allow(missing_docs)]
    pub archives: ArchiveStore,
    /// Where temporary export directories are created.
    pub scratch_directory: PathBuf,
    /// The gzip level, 0 to 9.
    pub compression_level: u32,
}

impl Pipeline {
    /// Run the backup with `backup_id`, which must be pending in the catalog.
    ///
    /// Export, compress, checksum, persist and mirror run strictly in order. On failure the record
    /// is marked failed. The temporary export directory is removed on every path.
    pub fn run(&self, context: &mut Context, backup_id: &str) -> Result<BackupRecord, PipelineError> {
        context.current_context = "Start";
        self.catalog.update(backup_id, BackupRecord::start)?;
        info!("{context}Backup started");

        let completion = match self.produce(context, backup_id) {
            Ok(completion) => completion,
            Err(error) => {
                context.current_context = "Fail";
                error!("{context}Backup failed: {error}");

                if let Err(update_error) = self
                    .catalog
                    .update(backup_id, |record| record.fail(error.to_string(), Utc::now()))
                {
                    warn!("{context}Could not mark the backup as failed: {update_error}");
                }

                return Err(error);
            }
        };

        context.current_context = "Complete";
        let file_path = completion.file_path.clone();
        let cloud_path = completion.cloud_path.clone();

        match self
            .catalog
            .update(backup_id, |record| record.complete(completion, Utc::now()))
        {
            Ok(((), record)) => {
                info!(
                    "{context}Backup completed, {} in {}ms",
                    format_file_size(record.backup_size().unwrap_or(0)),
                    record.duration_ms().unwrap_or(0)
                );
                Ok(record)
            }
            Err(error) => {
                // A transition error means the record has already moved on, e.g. after timing out.
                warn!("{context}Discarding the archive, the backup can no longer complete: {error}");
                if let Err(delete_error) = self
                    .archives
                    .delete(Some(&file_path), cloud_path.as_deref())
                {
                    warn!("{context}Could not discard the archive: {delete_error}");
                }

                if !matches!(error, CatalogError::Transition(_)) {
                    context.current_context = "Fail";
                    if let Err(update_error) = self
                        .catalog
                        .update(backup_id, |record| record.fail(error.to_string(), Utc::now()))
                    {
                        warn!("{context}Could not mark the backup as failed: {update_error}");
                    }
                }

                Err(PipelineError::Catalog(error))
            }
        }
    }

    fn produce(&self, context: &mut Context, backup_id: &str) -> Result<Completion, PipelineError> {
        fs::create_dir_all(&self.scratch_directory).map_err(PipelineError::Scratch)?;
        let scratch = tempfile::Builder::new()
            .prefix("backup_")
            .tempdir_in(&self.scratch_directory)
            .map_err(PipelineError::Scratch)?;

        let export_directory = scratch.path().join("export");
        let manifest = export(context, self.store.as_ref(), backup_id, &export_directory)?;

        context.current_context = "Compress";
        let compressed = compress(
            &export_directory,
            scratch.path(),
            backup_id,
            self.compression_level,
        )?;
        info!(
            "{context}{} compressed to {} ({:.1}% saved)",
            format_file_size(compressed.original_size),
            format_file_size(compressed.compressed_size),
            compressed.compression_ratio
        );

        context.current_context = "Checksum";
        let checksum = checksum(&compressed.archive_path)?;

        context.current_context = "Persist";
        let file_path = self.archives.persist(&compressed.archive_path)?;

        context.current_context = "Mirror";
        let cloud_path = self.archives.mirror(context, &file_path, backup_id);

        if let Err(error) = scratch.close() {
            warn!("{context}Failed to remove the export directory: {error}");
        }

        Ok(Completion {
            collections: manifest.collections,
            backup_size: compressed.compressed_size,
            compression_ratio: compressed.compression_ratio,
            checksum,
            file_path,
            cloud_path,
        })
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to update the backup record:\n{0}")]
    Catalog(#[from] CatalogError),

    #[error("Failed to create the export directory:\n{0}")]
    Scratch(#[source] io::Error),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Failed to compress the export:\n{0}")]
    Archive(#[from] ArchiveError),

    #[error("Failed to checksum the archive:\n{0}")]
    Checksum(#[from] ChecksumError),

    #[error("Failed to persist the archive:\n{0}")]
    Persist(#[from] ArchiveStoreError),
}
