//! Content hashes over archive files.
//!

use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::BackupRecord;

/// Compute the hex encoded BLAKE3 hash of a file's contents, streamed.
pub fn checksum(path: &Path) -> Result<String, ChecksumError> {
    let file = File::open(path).map_err(ChecksumError::Open)?;

    let mut hasher = blake3::Hasher::new();
    io::copy(&mut BufReader::with_capacity(64 * 1024, file), &mut hasher)
        .map_err(ChecksumError::Read)?;

    Ok(hasher.finalize().to_hex().to_string())
}

/// The result of verifying an archive against its record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// If the archive still matches the recorded checksum.
    pub verified: bool,

    /// A description of the outcome.
    pub message: String,
}

impl Verification {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            verified: false,
            message: message.into(),
        }
    }
}

/// Recompute the checksum of a record's archive and compare it with the stored value.
pub fn verify(record: &BackupRecord) -> Verification {
    let Some(path) = record.file_path() else {
        return Verification::failed("Backup file not found");
    };

    if !path.is_file() {
        return Verification::failed("Backup file not found");
    }

    let Some(expected) = record.checksum() else {
        return Verification::failed("Backup has no recorded checksum");
    };

    match checksum(path) {
        Ok(actual) if actual == expected => Verification {
            verified: true,
            message: "Backup verification successful".to_string(),
        },
        Ok(_) => Verification::failed("Checksum mismatch"),
        Err(error) => Verification::failed(error.to_string()),
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("Failed to open the file:\n{0}")]
    Open(#[source] io::Error),

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] io::Error),
}
