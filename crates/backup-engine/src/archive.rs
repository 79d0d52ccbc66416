//! Packaging an export directory into a single compressed archive, and back.
//!

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use thiserror::Error;

/// The file extension of every archive.
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// The archive file name for a backup.
pub fn archive_file_name(backup_id: &str) -> String {
    format!("{backup_id}.{ARCHIVE_EXTENSION}")
}

/// A compressed export.
#[derive(Debug, Clone)]
pub struct Compressed {
    /// Where the archive was written.
    pub archive_path: PathBuf,

    /// The size of the export directory in bytes.
    pub original_size: u64,

    /// The size of the archive in bytes.
    pub compressed_size: u64,

    /// The percentage saved by compressing.
    pub compression_ratio: f64,
}

/// The percentage of `original` saved by compressing it to `compressed` bytes.
#[allow(clippy::as_conversions)]
pub fn compression_ratio(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }

    (original as f64 - compressed as f64) / original as f64 * 100.0
}

/// The total size of the files in a directory tree.
pub fn directory_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            total += directory_size(&entry.path())?;
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }

    Ok(total)
}

/// Package every file in `export_directory` into `<destination_directory>/<backup_id>.tar.gz`.
pub fn compress(
    export_directory: &Path,
    destination_directory: &Path,
    backup_id: &str,
    level: u32,
) -> Result<Compressed, ArchiveError> {
    let archive_path = destination_directory.join(archive_file_name(backup_id));

    let file = File::create(&archive_path).map_err(|e| ArchiveError::Io(e, "create archive"))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(level.min(9)));
    let mut builder = tar::Builder::new(encoder);

    // Sort the entries so the same export produces the same archive layout.
    let mut entries: Vec<PathBuf> = fs::read_dir(export_directory)
        .map_err(|e| ArchiveError::Io(e, "read export directory"))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<io::Result<_>>()
        .map_err(|e| ArchiveError::Io(e, "read export directory"))?;
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name() else {
            continue;
        };

        if path.is_dir() {
            builder
                .append_dir_all(name, &path)
                .map_err(|e| ArchiveError::Io(e, "append directory"))?;
        } else {
            builder
                .append_path_with_name(&path, name)
                .map_err(|e| ArchiveError::Io(e, "append file"))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ArchiveError::Io(e, "finish archive"))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| ArchiveError::Io(e, "finish compression"))?;
    writer.flush().map_err(|e| ArchiveError::Io(e, "flush archive"))?;
    drop(writer);

    let original_size =
        directory_size(export_directory).map_err(|e| ArchiveError::Io(e, "measure export"))?;
    let compressed_size = fs::metadata(&archive_path)
        .map_err(|e| ArchiveError::Io(e, "measure archive"))?
        .len();

    Ok(Compressed {
        archive_path,
        original_size,
        compressed_size,
        compression_ratio: compression_ratio(original_size, compressed_size),
    })
}

/// Unpack an archive into `destination`.
pub fn extract(archive_path: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(|e| ArchiveError::Io(e, "open archive"))?;

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive
        .unpack(destination)
        .map_err(|e| ArchiveError::Io(e, "unpack archive"))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to {1}:\n{0}")]
    Io(#[source] io::Error, &'static str),
}
