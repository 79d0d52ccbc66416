//! Replaying an archive back into the document store.
//!
//! Everything that can make a restore impossible (an unreadable archive, a missing manifest, an
//! empty selection) is checked before the first write. Once writing has begun, failures are
//! recorded in the report and the restore carries on.
//!

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    Context,
    archive::{ArchiveError, extract},
    export::{ExportManifest, ManifestError, UnitReader, unit_file_name},
    object_id::reconstruct,
    store::{Document, DocumentStore, ID_FIELD, UpsertOutcome, document_id},
};

/// The number of documents written per bulk insert.
pub const REPLACE_BATCH_SIZE: usize = 1000;

/// How a restore treats a document whose identifier already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the existing document.
    #[default]
    Skip,
    /// Bulk insert everything.
    Replace,
    /// Overwrite the existing document.
    Merge,
}

/// Parameters of a restore.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Drop each collection before writing to it.
    pub drop_existing: bool,

    #[allow(missing_docs)]
    pub conflict_resolution: ConflictResolution,

    /// Only restore these collections, all collections if `None`.
    pub collections: Option<Vec<String>>,
}

impl RestoreOptions {
    /// The resolution actually applied, dropping collections always replaces.
    pub fn effective_resolution(&self) -> ConflictResolution {
        if self.drop_existing {
            ConflictResolution::Replace
        } else {
            self.conflict_resolution
        }
    }
}

/// The fields of each collection that hold identifiers, as dot separated paths.
///
/// The primary key is always treated as an identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierFields(BTreeMap<String, Vec<String>>);

impl IdentifierFields {
    #[allow(missing_docs)]
    pub fn new(fields: BTreeMap<String, Vec<String>>) -> Self {
        Self(fields)
    }

    /// The identifier paths of a collection.
    pub fn paths(&self, collection: &str) -> Vec<&str> {
        let mut paths = vec![ID_FIELD];
        if let Some(fields) = self.0.get(collection) {
            paths.extend(
                fields
                    .iter()
                    .map(String::as_str)
                    .filter(|field| *field != ID_FIELD),
            );
        }
        paths
    }

    /// Convert the portable identifiers of a document back into native identifiers.
    pub fn reconstruct(&self, collection: &str, document: &mut Document) {
        for path in self.paths(collection) {
            let segments: Vec<&str> = path.split('.').collect();
            reconstruct_path(document, &segments);
        }
    }
}

fn reconstruct_path(document: &mut Document, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if let Some(value) = document.get_mut(*first) {
        reconstruct_value(value, rest);
    }
}

fn reconstruct_value(value: &mut Value, segments: &[&str]) {
    if segments.is_empty() {
        reconstruct(value);
        return;
    }

    match value {
        Value::Object(object) => reconstruct_path(object, segments),
        Value::Array(values) => values
            .iter_mut()
            .for_each(|value| reconstruct_value(value, segments)),
        _ => {}
    }
}

/// The backup a restore was made from.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub backup_date: DateTime<Utc>,
    pub database_name: String,
}

/// What happened to a single collection.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub name: String,
    pub documents: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// A document or collection that could not be restored.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentError {
    pub collection: String,
    pub document: Option<String>,
    pub error: String,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    pub total_collections: u64,
    pub processed_collections: u64,
    pub total_documents: u64,
    pub inserted_documents: u64,
    pub updated_documents: u64,
    pub skipped_documents: u64,
    pub collections: Vec<CollectionReport>,
    pub errors: Vec<DocumentError>,
}

/// Who restored and how.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreAudit {
    pub restored_by: String,
    pub options: RestoreOptions,
}

/// The outcome of a restore.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// If the restore got as far as writing. Individual document failures do not affect this.
    pub success: bool,
    pub backup_info: BackupInfo,
    pub restore_date: DateTime<Utc>,
    pub stats: RestoreStats,
    pub message: String,
    pub audit: Option<RestoreAudit>,
}

/// Restore the archive at `archive_path` into `store`.
///
/// The archive is extracted into a temporary directory under `scratch_directory` that is removed
/// on every exit path.
pub fn restore(
    context: &mut Context,
    store: &dyn DocumentStore,
    archive_path: &Path,
    scratch_directory: &Path,
    options: &RestoreOptions,
    identifiers: &IdentifierFields,
) -> Result<RestoreReport, RestoreError> {
    context.current_context = "Extract";

    fs::create_dir_all(scratch_directory).map_err(RestoreError::Scratch)?;
    let extracted = tempfile::Builder::new()
        .prefix("restore_")
        .tempdir_in(scratch_directory)
        .map_err(RestoreError::Scratch)?;

    extract(archive_path, extracted.path()).map_err(RestoreError::Extract)?;

    context.current_context = "Validate";
    let manifest = ExportManifest::load(extracted.path())?;

    let selected = select_collections(&manifest, options.collections.as_deref())?;
    info!(
        "{context}Restoring {} of {} collections from {}",
        selected.len(),
        manifest.collections.len(),
        manifest.backup_id
    );

    context.current_context = "Replay";
    let resolution = options.effective_resolution();
    let mut stats = RestoreStats {
        total_collections: u64::try_from(selected.len()).unwrap_or(u64::MAX),
        ..RestoreStats::default()
    };

    for collection in selected {
        let unit_path = extracted.path().join(unit_file_name(&collection));
        let mut unit = match UnitReader::open(&unit_path) {
            Ok(unit) => unit,
            Err(error) => {
                warn!("{context}Skipping collection '{collection}': {error}");
                stats.errors.push(DocumentError {
                    collection,
                    document: None,
                    error: error.to_string(),
                });
                continue;
            }
        };

        if unit.header().collection != collection {
            warn!(
                "{context}Skipping collection '{collection}', its export unit is for '{}'",
                unit.header().collection
            );
            stats.errors.push(DocumentError {
                error: format!(
                    "export unit belongs to collection '{}'",
                    unit.header().collection
                ),
                collection,
                document: None,
            });
            continue;
        }

        if unit.header().count == 0 {
            info!("{context}Skipping empty collection '{collection}'");
            stats.processed_collections += 1;
            stats.collections.push(CollectionReport {
                name: collection,
                ..CollectionReport::default()
            });
            continue;
        }

        if options.drop_existing {
            if let Err(error) = store.drop_collection(&collection) {
                warn!("{context}Failed to drop collection '{collection}', continuing:\n{error}");
                stats.errors.push(DocumentError {
                    collection: collection.clone(),
                    document: None,
                    error: format!("Failed to drop collection: {error}"),
                });
            }
        }

        let mut report = CollectionReport {
            name: collection.clone(),
            ..CollectionReport::default()
        };
        let mut errors = Vec::new();

        let mut replay = Replay {
            store,
            identifiers,
            collection: &collection,
            report: &mut report,
            errors: &mut errors,
        };
        match resolution {
            ConflictResolution::Replace => replay.replace(&mut unit),
            ConflictResolution::Skip => replay.skip(&mut unit),
            ConflictResolution::Merge => replay.merge(&mut unit),
        }

        info!(
            "{context}{collection}: {} documents, {} inserted, {} updated, {} skipped, {} errors",
            report.documents, report.inserted, report.updated, report.skipped, report.errors
        );

        stats.processed_collections += 1;
        stats.total_documents += report.documents;
        stats.inserted_documents += report.inserted;
        stats.updated_documents += report.updated;
        stats.skipped_documents += report.skipped;
        stats.collections.push(report);
        stats.errors.append(&mut errors);
    }

    let message = format!(
        "Restore completed: {}/{} collections processed",
        stats.processed_collections, stats.total_collections
    );
    info!("{context}{message}");

    if let Err(error) = extracted.close() {
        warn!("{context}Failed to remove the extraction directory: {error}");
    }

    Ok(RestoreReport {
        success: true,
        backup_info: BackupInfo {
            backup_id: manifest.backup_id,
            backup_date: manifest.backup_date,
            database_name: manifest.database_name,
        },
        restore_date: Utc::now(),
        stats,
        message,
        audit: None,
    })
}

/// The collections to restore, in archive order.
fn select_collections(
    manifest: &ExportManifest,
    requested: Option<&[String]>,
) -> Result<Vec<String>, RestoreError> {
    let names = manifest.collections.iter().map(|c| c.name.clone());

    let selected: Vec<String> = match requested {
        Some(requested) => {
            let requested: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
            names.filter(|name| requested.contains(name.as_str())).collect()
        }
        None => names.collect(),
    };

    if selected.is_empty() {
        return Err(RestoreError::NoMatchingCollections);
    }

    Ok(selected)
}

/// Writes one collection's documents and counts the outcome.
struct Replay<'a> {
    store: &'a dyn DocumentStore,
    identifiers: &'a IdentifierFields,
    collection: &'a str,
    report: &'a mut CollectionReport,
    errors: &'a mut Vec<DocumentError>,
}

impl Replay<'_> {
    /// Read the next document and reconstruct its identifiers, recording unreadable lines.
    fn next_document(&mut self, unit: &mut UnitReader) -> Option<Option<Document>> {
        let document = unit.next()?;
        self.report.documents += 1;

        match document {
            Ok(mut document) => {
                self.identifiers.reconstruct(self.collection, &mut document);
                Some(Some(document))
            }
            Err(error) => {
                self.record_error(None, error.to_string());
                Some(None)
            }
        }
    }

    fn record_error(&mut self, document: Option<String>, error: String) {
        self.report.errors += 1;
        self.errors.push(DocumentError {
            collection: self.collection.to_string(),
            document,
            error,
        });
    }

    fn replace(&mut self, unit: &mut UnitReader) {
        let mut batch = Vec::with_capacity(REPLACE_BATCH_SIZE);

        while let Some(document) = self.next_document(unit) {
            let Some(document) = document else {
                continue;
            };

            batch.push(document);
            if batch.len() >= REPLACE_BATCH_SIZE {
                self.insert_batch(core::mem::take(&mut batch));
            }
        }

        if !batch.is_empty() {
            self.insert_batch(batch);
        }
    }

    fn insert_batch(&mut self, batch: Vec<Document>) {
        let size = u64::try_from(batch.len()).unwrap_or(u64::MAX);

        match self.store.insert_many(self.collection, batch) {
            Ok(outcome) => {
                self.report.inserted += outcome.inserted;
                for failure in outcome.failures {
                    self.record_error(failure.id, failure.error.to_string());
                }
            }
            Err(error) => {
                self.record_error(None, format!("Bulk insert of {size} documents failed: {error}"));
                // The single entry above stands for the whole batch.
                self.report.errors += size.saturating_sub(1);
            }
        }
    }

    fn skip(&mut self, unit: &mut UnitReader) {
        while let Some(document) = self.next_document(unit) {
            let Some(document) = document else {
                continue;
            };

            let id = document_id(&document);
            match self.store.insert_one(self.collection, document) {
                Ok(()) => self.report.inserted += 1,
                Err(error) if error.is_duplicate() => self.report.skipped += 1,
                Err(error) => self.record_error(id, error.to_string()),
            }
        }
    }

    fn merge(&mut self, unit: &mut UnitReader) {
        while let Some(document) = self.next_document(unit) {
            let Some(document) = document else {
                continue;
            };

            let id = document_id(&document);
            match self.store.upsert(self.collection, document) {
                Ok(UpsertOutcome::Inserted) => self.report.inserted += 1,
                Ok(UpsertOutcome::Updated) => self.report.updated += 1,
                Err(error) => self.record_error(id, error.to_string()),
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Failed to prepare the extraction directory:\n{0}")]
    Scratch(#[source] io::Error),

    #[error("Restore failed, the archive could not be extracted:\n{0}")]
    Extract(#[source] ArchiveError),

    #[error("Restore failed: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Restore failed: none of the requested collections are in the backup")]
    NoMatchingCollections,
}
