//! Where finished archives live: a mandatory local directory and an optional remote mirror.
//!

use core::fmt::Debug;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{info, warn};

use crate::Context;

/// A remote object store archives can be copied to.
pub trait ObjectStore: Debug + Send + Sync {
    /// Upload a local file under `key`, returning a reference to the uploaded object.
    fn upload(&self, path: &Path, key: &str) -> Result<String, ObjectStoreError>;

    /// Delete an uploaded object by its reference.
    fn delete(&self, reference: &str) -> Result<(), ObjectStoreError>;
}

/// An object store backed by a directory, e.g. a network mount.
#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    #[allow(missing_docs)]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ObjectStore for DirectoryMirror {
    fn upload(&self, path: &Path, key: &str) -> Result<String, ObjectStoreError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| ObjectStoreError::Rejected(format!("{path:?} has no file name")))?;

        let directory = self.root.join(key);
        fs::create_dir_all(&directory).map_err(ObjectStoreError::Io)?;

        let destination = directory.join(file_name);
        fs::copy(path, &destination).map_err(ObjectStoreError::Io)?;

        Ok(destination.to_string_lossy().into_owned())
    }

    fn delete(&self, reference: &str) -> Result<(), ObjectStoreError> {
        let path = PathBuf::from(reference);
        if !path.starts_with(&self.root) {
            return Err(ObjectStoreError::Rejected(format!(
                "'{reference}' is outside the mirror"
            )));
        }

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(ObjectStoreError::Io(error)),
        }

        if let Some(parent) = path.parent() {
            // Only removes the per backup directory if it is now empty.
            let _ = fs::remove_dir(parent);
        }

        Ok(())
    }
}

/// Persists archives locally and mirrors them remotely.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    directory: PathBuf,
    mirror: Option<Arc<dyn ObjectStore>>,
}

impl ArchiveStore {
    /// Create an archive store, creating the local directory if needed.
    pub fn new(
        directory: PathBuf,
        mirror: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self, ArchiveStoreError> {
        fs::create_dir_all(&directory)
            .map_err(|e| ArchiveStoreError::Io(e, "create the backup directory"))?;

        Ok(Self { directory, mirror })
    }

    /// The local archive directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Move an archive into the local archive directory, returning its new path.
    pub fn persist(&self, archive_path: &Path) -> Result<PathBuf, ArchiveStoreError> {
        let file_name = archive_path.file_name().ok_or_else(|| {
            ArchiveStoreError::Io(
                io::Error::new(io::ErrorKind::InvalidInput, "archive has no file name"),
                "persist the archive",
            )
        })?;
        let destination = self.directory.join(file_name);

        if fs::rename(archive_path, &destination).is_err() {
            // Scratch and backup directories may be on different filesystems.
            fs::copy(archive_path, &destination)
                .map_err(|e| ArchiveStoreError::Io(e, "copy the archive"))?;
            if let Err(error) = fs::remove_file(archive_path) {
                warn!("Failed to remove {archive_path:?} after copying it: {error}");
            }
        }

        Ok(destination)
    }

    /// Copy an archive to the remote mirror, if there is one.
    ///
    /// Failures are logged and result in `None`, a backup without a remote copy is still usable.
    pub fn mirror(&self, context: &Context, archive_path: &Path, backup_id: &str) -> Option<String> {
        let mirror = self.mirror.as_ref()?;

        match mirror.upload(archive_path, &format!("backups/{backup_id}")) {
            Ok(reference) => {
                info!("{context}Mirrored archive to {reference}");
                Some(reference)
            }
            Err(error) => {
                warn!("{context}Failed to mirror the archive, keeping the local copy only:\n{error}");
                None
            }
        }
    }

    /// Delete a local archive and its remote copy.
    ///
    /// A missing local file is not an error. Failing to delete the remote copy is logged only.
    pub fn delete(
        &self,
        local_path: Option<&Path>,
        remote_reference: Option<&str>,
    ) -> Result<(), ArchiveStoreError> {
        let local_result = match local_path {
            Some(path) => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(ArchiveStoreError::Io(error, "delete the archive")),
            },
            None => Ok(()),
        };

        if let Some(reference) = remote_reference {
            match &self.mirror {
                Some(mirror) => {
                    if let Err(error) = mirror.delete(reference) {
                        warn!("Failed to delete remote archive '{reference}':\n{error}");
                    }
                }
                None => warn!("No mirror configured to delete remote archive '{reference}'"),
            }
        }

        local_result
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ArchiveStoreError {
    #[error("Failed to {1}:\n{0}")]
    Io(#[source] io::Error, &'static str),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object store IO failed:\n{0}")]
    Io(#[source] io::Error),

    #[error("Object store rejected the request: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_mirror_and_delete() {
        let scratch = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();

        let archive = scratch.path().join("backup_1.tar.gz");
        fs::write(&archive, b"archive").unwrap();

        let mirror: Arc<dyn ObjectStore> = Arc::new(DirectoryMirror::new(remote.path().to_path_buf()));
        let store = ArchiveStore::new(backups.path().to_path_buf(), Some(mirror)).unwrap();

        let local = store.persist(&archive).unwrap();
        assert!(local.is_file());
        assert!(!archive.exists());

        let reference = store
            .mirror(&Context::default(), &local, "backup_1")
            .unwrap();
        assert!(Path::new(&reference).is_file());

        store.delete(Some(&local), Some(&reference)).unwrap();
        assert!(!local.exists());
        assert!(!Path::new(&reference).exists());

        // Deleting again is not an error.
        store.delete(Some(&local), Some(&reference)).unwrap();
    }

    #[test]
    fn no_mirror_means_local_only() {
        let backups = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(backups.path().to_path_buf(), None).unwrap();

        assert!(
            store
                .mirror(&Context::default(), Path::new("missing.tar.gz"), "backup_1")
                .is_none()
        );
    }
}
