//! Snapshot export: one export unit per collection plus a manifest describing them.
//!
//! An export unit is a JSON lines file. Its first line is a [`UnitHeader`], every following line
//! is one document with identifiers in their portable form.
//!

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Lines, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    Context,
    object_id::to_portable,
    store::{Document, DocumentStore, StoreError, is_valid_collection_name},
};

/// The file name of the manifest inside an export.
pub const MANIFEST_FILE: &str = "backup-summary.json";

/// The manifest format version.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// How the export was produced.
pub const EXPORT_METHOD: &str = "json-lines";

/// The export unit file name for a collection.
pub fn unit_file_name(collection: &str) -> String {
    format!("{collection}.jsonl")
}

/// What was captured of one collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// The collection name.
    pub name: String,

    /// The number of documents exported.
    pub document_count: u64,

    /// The size of the export unit in bytes.
    pub size: u64,
}

/// The authoritative description of an export's contents.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub backup_id: String,
    pub backup_date: DateTime<Utc>,
    pub database_name: String,
    pub total_collections: u64,
    pub total_documents: u64,
    pub total_size: u64,
    pub collections: Vec<CollectionStats>,
    pub version: String,
    pub method: String,
}

impl ExportManifest {
    /// Read and validate the manifest of an export directory.
    pub fn load(directory: &Path) -> Result<Self, ManifestError> {
        let path = directory.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(ManifestError::Missing);
        }

        let file = File::open(&path).map_err(ManifestError::Read)?;
        let manifest: Self = serde_json::from_reader(BufReader::new(file))?;
        manifest.validate()?;

        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if let Some(collection) = self
            .collections
            .iter()
            .find(|collection| !is_valid_collection_name(&collection.name))
        {
            return Err(ManifestError::Invalid(format!(
                "invalid collection name '{}'",
                collection.name
            )));
        }

        let total_collections = u64::try_from(self.collections.len()).unwrap_or(u64::MAX);
        if total_collections != self.total_collections {
            return Err(ManifestError::Invalid(format!(
                "lists {} collections but claims {}",
                total_collections, self.total_collections
            )));
        }

        let total_documents: u64 = self.collections.iter().map(|c| c.document_count).sum();
        if total_documents != self.total_documents {
            return Err(ManifestError::Invalid(format!(
                "lists {} documents but claims {}",
                total_documents, self.total_documents
            )));
        }

        Ok(())
    }

    fn write(&self, directory: &Path) -> Result<(), ExportError> {
        let file = File::create(directory.join(MANIFEST_FILE))
            .map_err(|e| ExportError::Io(e, "create manifest"))?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, self).map_err(ExportError::Serialize)?;
        writer
            .flush()
            .map_err(|e| ExportError::Io(e, "write manifest"))
    }
}

/// The first line of an export unit.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitHeader {
    pub collection: String,
    pub count: u64,
    pub exported_at: DateTime<Utc>,
    pub backup_id: String,
}

/// Export every collection of `store` into `directory`, then write the manifest.
///
/// A collection that cannot be read or written is left out of the export. Only a connection level
/// failure of the store aborts the export, in which case no manifest is written.
pub fn export(
    context: &mut Context,
    store: &dyn DocumentStore,
    backup_id: &str,
    directory: &Path,
) -> Result<ExportManifest, ExportError> {
    context.current_context = "Export";

    fs::create_dir_all(directory).map_err(|e| ExportError::Io(e, "create export directory"))?;

    let names = store.list_collections().map_err(ExportError::Store)?;
    info!("{context}Exporting {} collections", names.len());

    let mut collections = Vec::with_capacity(names.len());
    for name in names {
        match export_collection(store, backup_id, &name, directory) {
            Ok(stats) => {
                info!("{context}{name}: {} documents", stats.document_count);
                collections.push(stats);
            }
            Err(error) if error.is_unavailable() => {
                return Err(ExportError::Store(error.into_store_error()));
            }
            Err(error) => {
                warn!("{context}Failed to export collection '{name}': {error}");
                remove_if_exists(&directory.join(unit_file_name(&name)));
                remove_if_exists(&part_path(directory, &name));
            }
        }
    }

    let manifest = ExportManifest {
        backup_id: backup_id.to_string(),
        backup_date: Utc::now(),
        database_name: store.name(),
        total_collections: u64::try_from(collections.len()).unwrap_or(u64::MAX),
        total_documents: collections.iter().map(|c| c.document_count).sum(),
        total_size: collections.iter().map(|c| c.size).sum(),
        collections,
        version: MANIFEST_VERSION.to_string(),
        method: EXPORT_METHOD.to_string(),
    };
    manifest.write(directory)?;

    info!(
        "{context}Exported {} collections, {} documents",
        manifest.total_collections, manifest.total_documents
    );

    Ok(manifest)
}

fn part_path(directory: &Path, collection: &str) -> PathBuf {
    directory.join(format!("{}.part", unit_file_name(collection)))
}

fn remove_if_exists(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {path:?}: {error}");
        }
    }
}

/// Stream a collection's documents into its export unit.
///
/// Documents are first streamed to a part file so the header can carry the final count.
fn export_collection(
    store: &dyn DocumentStore,
    backup_id: &str,
    collection: &str,
    directory: &Path,
) -> Result<CollectionStats, CollectionExportError> {
    if !is_valid_collection_name(collection) {
        return Err(CollectionExportError::InvalidName(collection.to_string()));
    }

    let part_path = part_path(directory, collection);
    let mut count: u64 = 0;
    {
        let file = File::create(&part_path).map_err(CollectionExportError::Io)?;
        let mut writer = BufWriter::new(file);

        for document in store.read_all(collection)? {
            let document = to_portable(Value::Object(document?));
            serde_json::to_writer(&mut writer, &document)?;
            writer.write_all(b"\n").map_err(CollectionExportError::Io)?;
            count += 1;
        }

        writer.flush().map_err(CollectionExportError::Io)?;
    }

    let header = UnitHeader {
        collection: collection.to_string(),
        count,
        exported_at: Utc::now(),
        backup_id: backup_id.to_string(),
    };

    let unit_path = directory.join(unit_file_name(collection));
    {
        let file = File::create(&unit_path).map_err(CollectionExportError::Io)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n").map_err(CollectionExportError::Io)?;

        let mut part = BufReader::new(File::open(&part_path).map_err(CollectionExportError::Io)?);
        io::copy(&mut part, &mut writer).map_err(CollectionExportError::Io)?;
        writer.flush().map_err(CollectionExportError::Io)?;
    }
    fs::remove_file(&part_path).map_err(CollectionExportError::Io)?;

    let size = fs::metadata(&unit_path)
        .map_err(CollectionExportError::Io)?
        .len();

    Ok(CollectionStats {
        name: collection.to_string(),
        document_count: count,
        size,
    })
}

/// A streaming reader over an export unit.
pub struct UnitReader {
    header: UnitHeader,
    lines: Lines<BufReader<File>>,
}

impl UnitReader {
    /// Open an export unit and read its header.
    pub fn open(path: &Path) -> Result<Self, UnitError> {
        let file = File::open(path).map_err(UnitError::Open)?;
        let mut lines = BufReader::new(file).lines();

        let header = match lines.next() {
            Some(line) => serde_json::from_str(&line.map_err(UnitError::Read)?)
                .map_err(UnitError::Header)?,
            None => return Err(UnitError::Empty),
        };

        Ok(Self { header, lines })
    }

    /// The unit's header.
    pub fn header(&self) -> &UnitHeader {
        &self.header
    }
}

impl Iterator for UnitReader {
    type Item = Result<Document, UnitError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(error) => return Some(Err(UnitError::Read(error))),
            };

            if line.trim().is_empty() {
                continue;
            }

            return Some(serde_json::from_str(&line).map_err(UnitError::Document));
        }
    }
}

/// A failure to export a single collection.
#[derive(Debug, Error)]
enum CollectionExportError {
    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("Invalid collection name '{0}'")]
    InvalidName(String),

    #[error("Failed to write the export unit:\n{0}")]
    Io(#[source] io::Error),

    #[error("Failed to serialize a document:\n{0}")]
    Serialize(#[from] serde_json::Error),
}

impl CollectionExportError {
    fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_unavailable())
    }

    fn into_store_error(self) -> StoreError {
        match self {
            Self::Store(error) => error,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Backup failed, the store could not be read:\n{0}")]
    Store(#[source] StoreError),

    #[error("Failed to {1}:\n{0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to serialize the manifest:\n{0}")]
    Serialize(#[source] serde_json::Error),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Invalid backup file: missing backup-summary.json")]
    Missing,

    #[error("Failed to read the manifest:\n{0}")]
    Read(#[source] io::Error),

    #[error("Failed to parse the manifest:\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Failed to open the export unit:\n{0}")]
    Open(#[source] io::Error),

    #[error("Failed to read the export unit:\n{0}")]
    Read(#[source] io::Error),

    #[error("The export unit has no header")]
    Empty,

    #[error("Failed to parse the export unit header:\n{0}")]
    Header(#[source] serde_json::Error),

    #[error("Failed to parse a document:\n{0}")]
    Document(#[source] serde_json::Error),
}
