//! The persisted, queryable set of backup and restore records.
//!

use core::cmp::Ordering;
use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::Tier;
use thiserror::Error;
use tracing::warn;

use crate::record::{
    BackupRecord, BackupStatus, BackupType, RestoreRecord, TransitionError,
};

/// The error message of a backup that was running when its process stopped.
pub const INTERRUPTED_BACKUP: &str = "Backup interrupted before it finished";

/// The error message of a restore that was running when its process stopped.
pub const INTERRUPTED_RESTORE: &str = "Restore interrupted before it finished";

/// What listings can be ordered by.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    BackupSize,
    Duration,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// A filtered, sorted and paginated listing request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Only list records with this status.
    pub status: Option<BackupStatus>,

    /// Only list records of this type.
    pub backup_type: Option<BackupType>,

    #[allow(missing_docs)]
    pub sort_by: SortField,

    #[allow(missing_docs)]
    pub order: SortOrder,

    /// The page to return, starting at 1.
    pub page: u64,

    /// The number of records per page.
    pub limit: u64,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            backup_type: None,
            sort_by: SortField::CreatedAt,
            order: SortOrder::Desc,
            page: 1,
            limit: 10,
        }
    }
}

/// One page of a listing.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub current_page: u64,
    pub total_pages: u64,
    pub total: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    /// Convert the items of the page, keeping the pagination.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            current_page: self.current_page,
            total_pages: self.total_pages,
            total: self.total,
            has_next: self.has_next,
            has_prev: self.has_prev,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    backups: BTreeMap<String, BackupRecord>,
    restores: BTreeMap<String, RestoreRecord>,
}

impl CatalogState {
    /// Fail every record that never reached a terminal state, returning how many were changed.
    fn fail_interrupted(&mut self, now: DateTime<Utc>) -> usize {
        let mut interrupted = 0;

        for record in self.backups.values_mut() {
            if record.status().is_terminal() {
                continue;
            }
            warn!("Backup {} was left {}, marking it failed", record.id(), record.status());
            if record.fail(INTERRUPTED_BACKUP.to_string(), now).is_ok() {
                interrupted += 1;
            }
        }

        for record in self.restores.values_mut() {
            if record.is_finished() {
                continue;
            }
            warn!("Restore {} was left {}, marking it failed", record.id, record.status);
            if record.fail(INTERRUPTED_RESTORE.to_string(), now).is_ok() {
                interrupted += 1;
            }
        }

        interrupted
    }
}

/// Backup and restore records kept in a JSON file.
///
/// Every mutation is written through to disk before it returns.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl Catalog {
    /// Load the catalog from `path`, creating an empty one if the file does not exist.
    ///
    /// Nothing runs before the catalog is loaded, so pending and in progress records left behind
    /// by a previous process are marked failed.
    pub fn load_or_create(path: PathBuf) -> Result<Self, CatalogError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|e| CatalogError::Io(e, "create directory"))?;
                }
            }

            let state = CatalogState::default();
            save(&path, &state)?;

            return Ok(Self {
                path,
                state: Mutex::new(state),
            });
        }

        let contents = fs::read_to_string(&path).map_err(|e| CatalogError::Io(e, "read"))?;
        let mut state: CatalogState =
            serde_json::from_str(&contents).map_err(CatalogError::Deserialize)?;

        if state.fail_interrupted(Utc::now()) > 0 {
            save(&path, &state)?;
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Where the catalog is stored.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a new backup record.
    pub fn insert(&self, record: BackupRecord) -> Result<(), CatalogError> {
        let mut state = self.lock()?;

        if state.backups.contains_key(record.id()) {
            return Err(CatalogError::Duplicate(record.id().to_string()));
        }

        let id = record.id().to_string();
        state.backups.insert(id.clone(), record);

        if let Err(error) = save(&self.path, &state) {
            state.backups.remove(&id);
            return Err(error);
        }

        Ok(())
    }

    /// Get a backup record.
    pub fn get(&self, id: &str) -> Result<Option<BackupRecord>, CatalogError> {
        Ok(self.lock()?.backups.get(id).cloned())
    }

    /// Apply a state transition to a backup record and persist the result.
    ///
    /// The record is left untouched if the transition is rejected.
    pub fn update<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut BackupRecord) -> Result<T, TransitionError>,
    ) -> Result<(T, BackupRecord), CatalogError> {
        let mut state = self.lock()?;

        let Some(current) = state.backups.get(id) else {
            return Err(CatalogError::NotFound(id.to_string()));
        };

        let mut updated = current.clone();
        let value = apply(&mut updated)?;

        let previous = state.backups.insert(id.to_string(), updated.clone());
        if let Err(error) = save(&self.path, &state) {
            if let Some(previous) = previous {
                state.backups.insert(id.to_string(), previous);
            }
            return Err(error);
        }

        Ok((value, updated))
    }

    /// Remove a backup record, returning it if it existed.
    pub fn remove(&self, id: &str) -> Result<Option<BackupRecord>, CatalogError> {
        let mut state = self.lock()?;

        let Some(removed) = state.backups.remove(id) else {
            return Ok(None);
        };

        if let Err(error) = save(&self.path, &state) {
            state.backups.insert(id.to_string(), removed);
            return Err(error);
        }

        Ok(Some(removed))
    }

    /// Every backup record, newest first.
    pub fn all(&self) -> Result<Vec<BackupRecord>, CatalogError> {
        let mut records: Vec<_> = self.lock()?.backups.values().cloned().collect();
        records.sort_by(|a, b| b.start_time().cmp(&a.start_time()));
        Ok(records)
    }

    /// A page of backup records matching the query.
    pub fn list(&self, query: &ListQuery) -> Result<Page<BackupRecord>, CatalogError> {
        let mut records: Vec<_> = self
            .lock()?
            .backups
            .values()
            .filter(|record| query.status.is_none_or(|status| record.status() == status))
            .filter(|record| {
                query
                    .backup_type
                    .is_none_or(|backup_type| record.backup_type() == backup_type)
            })
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            let ordering = compare(a, b, query.sort_by).then_with(|| a.id().cmp(b.id()));
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let limit = query.limit.max(1);
        let page = query.page.max(1);
        let total = u64::try_from(records.len()).unwrap_or(u64::MAX);
        let total_pages = total.div_ceil(limit);

        let skip = usize::try_from((page - 1).saturating_mul(limit)).unwrap_or(usize::MAX);
        let take = usize::try_from(limit).unwrap_or(usize::MAX);
        let items = records.into_iter().skip(skip).take(take).collect();

        Ok(Page {
            items,
            current_page: page,
            total_pages,
            total,
            has_next: page < total_pages,
            has_prev: page > 1,
        })
    }

    /// Backups whose retention has run out at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>, CatalogError> {
        Ok(self
            .lock()?
            .backups
            .values()
            .filter(|record| record.auto_delete_at() <= now)
            .cloned()
            .collect())
    }

    /// The most recent completed backup of a tier.
    pub fn last_completed(&self, tier: Tier) -> Result<Option<BackupRecord>, CatalogError> {
        Ok(self
            .lock()?
            .backups
            .values()
            .filter(|record| record.tier() == Some(tier))
            .filter(|record| record.status() == BackupStatus::Completed)
            .max_by_key(|record| record.start_time())
            .cloned())
    }

    /// Add a new restore record.
    pub fn insert_restore(&self, record: RestoreRecord) -> Result<(), CatalogError> {
        let mut state = self.lock()?;

        if state.restores.contains_key(&record.id) {
            return Err(CatalogError::Duplicate(record.id));
        }

        let id = record.id.clone();
        state.restores.insert(id.clone(), record);

        if let Err(error) = save(&self.path, &state) {
            state.restores.remove(&id);
            return Err(error);
        }

        Ok(())
    }

    #[allow(missing_docs)]
    pub fn get_restore(&self, id: &str) -> Result<Option<RestoreRecord>, CatalogError> {
        Ok(self.lock()?.restores.get(id).cloned())
    }

    /// Apply a state transition to a restore record and persist the result.
    pub fn update_restore<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut RestoreRecord) -> Result<T, TransitionError>,
    ) -> Result<(T, RestoreRecord), CatalogError> {
        let mut state = self.lock()?;

        let Some(current) = state.restores.get(id) else {
            return Err(CatalogError::NotFound(id.to_string()));
        };

        let mut updated = current.clone();
        let value = apply(&mut updated)?;

        let previous = state.restores.insert(id.to_string(), updated.clone());
        if let Err(error) = save(&self.path, &state) {
            if let Some(previous) = previous {
                state.restores.insert(id.to_string(), previous);
            }
            return Err(error);
        }

        Ok((value, updated))
    }

    fn lock(&self) -> Result<MutexGuard<'_, CatalogState>, CatalogError> {
        self.state.lock().map_err(|_| CatalogError::Poisoned)
    }
}

fn compare(a: &BackupRecord, b: &BackupRecord, field: SortField) -> Ordering {
    match field {
        SortField::CreatedAt => a.start_time().cmp(&b.start_time()),
        SortField::BackupSize => a.backup_size().unwrap_or(0).cmp(&b.backup_size().unwrap_or(0)),
        SortField::Duration => a.duration_ms().unwrap_or(0).cmp(&b.duration_ms().unwrap_or(0)),
    }
}

/// Write the state to a sibling file then move it over the catalog.
fn save(path: &Path, state: &CatalogState) -> Result<(), CatalogError> {
    let contents = serde_json::to_string_pretty(state).map_err(CatalogError::Serialize)?;

    let temporary = path.with_extension("json.tmp");
    fs::write(&temporary, contents).map_err(|e| CatalogError::Io(e, "write"))?;
    fs::rename(&temporary, path).map_err(|e| CatalogError::Io(e, "replace"))?;

    Ok(())
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to {1} the catalog:\n{0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to deserialize the catalog:\n{0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("Failed to serialize the catalog:\n{0}")]
    Serialize(#[source] serde_json::Error),

    #[error("A record with id '{0}' already exists")]
    Duplicate(String),

    #[error("No record with id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("The catalog lock was poisoned")]
    Poisoned,
}
