//! The persisted lifecycles of backup and restore attempts.
//!

use core::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use shared::Tier;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    export::CollectionStats,
    restore::{RestoreOptions, RestoreReport},
};

/// Where a backup is in its lifecycle.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// A completed backup whose archive no longer matches its checksum.
    Corrupted,
}

impl BackupStatus {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Corrupted => "corrupted",
        }
    }

    /// If the backup has stopped running, successfully or not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }
}

impl Display for BackupStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a backup.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Manual,
    Automatic,
    Scheduled,
}

impl BackupType {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
            Self::Scheduled => "scheduled",
        }
    }
}

impl Display for BackupType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a successful run produced.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub struct Completion {
    pub collections: Vec<CollectionStats>,
    pub backup_size: u64,
    pub compression_ratio: f64,
    pub checksum: String,
    pub file_path: PathBuf,
    pub cloud_path: Option<String>,
}

/// One backup attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    id: String,
    name: String,
    backup_type: BackupType,
    tier: Option<Tier>,
    created_by: String,

    status: BackupStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,

    collections: Vec<CollectionStats>,
    backup_size: Option<u64>,
    compression_ratio: Option<f64>,

    checksum: Option<String>,
    is_verified: bool,

    file_path: Option<PathBuf>,
    cloud_path: Option<String>,

    retention_days: u32,
    auto_delete_at: DateTime<Utc>,

    error_message: Option<String>,
}

impl BackupRecord {
    /// Generate a new backup identifier, `backup_<unix millis>_<random>`.
    pub fn generate_id(now: DateTime<Utc>) -> String {
        format!(
            "backup_{}_{}",
            now.timestamp_millis(),
            Uuid::new_v4().simple()
        )
    }

    /// Create a pending record, fixing when it becomes eligible for deletion.
    pub fn new(
        id: String,
        name: String,
        backup_type: BackupType,
        tier: Option<Tier>,
        created_by: String,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            backup_type,
            tier,
            created_by,
            status: BackupStatus::Pending,
            start_time: now,
            end_time: None,
            duration_ms: None,
            collections: Vec::new(),
            backup_size: None,
            compression_ratio: None,
            checksum: None,
            is_verified: false,
            file_path: None,
            cloud_path: None,
            retention_days,
            auto_delete_at: now + TimeDelta::days(i64::from(retention_days)),
            error_message: None,
        }
    }

    /// Move from pending to in progress.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(BackupStatus::InProgress, &[BackupStatus::Pending])
    }

    /// Move from in progress to completed, recording what the run produced.
    pub fn complete(
        &mut self,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(BackupStatus::Completed, &[BackupStatus::InProgress])?;

        self.collections = completion.collections;
        self.backup_size = Some(completion.backup_size);
        self.compression_ratio = Some(completion.compression_ratio);
        self.checksum = Some(completion.checksum);
        self.file_path = Some(completion.file_path);
        self.cloud_path = completion.cloud_path;
        // The checksum was computed from the bytes just persisted.
        self.is_verified = true;
        self.finish(now);

        Ok(())
    }

    /// Move a running backup to failed.
    pub fn fail(&mut self, message: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(
            BackupStatus::Failed,
            &[BackupStatus::Pending, BackupStatus::InProgress],
        )?;

        self.error_message = Some(message);
        self.finish(now);

        Ok(())
    }

    /// Record the outcome of verifying the archive, a failure marks the backup as corrupted.
    pub fn apply_verification(&mut self, verified: bool) -> Result<(), TransitionError> {
        match (self.status, verified) {
            (BackupStatus::Completed, true) => {
                self.is_verified = true;
                Ok(())
            }
            (BackupStatus::Completed, false) => {
                self.status = BackupStatus::Corrupted;
                self.is_verified = false;
                Ok(())
            }
            (BackupStatus::Corrupted, _) => {
                self.is_verified = false;
                Ok(())
            }
            (from, _) => Err(TransitionError::new(
                "backup",
                from.as_str(),
                if verified { "verified" } else { "corrupted" },
            )),
        }
    }

    /// If the backup can be restored from.
    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Completed && self.is_verified
    }

    fn transition(
        &mut self,
        to: BackupStatus,
        allowed_from: &[BackupStatus],
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError::new("backup", self.status.as_str(), to.as_str()));
        }

        self.status = to;
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).num_milliseconds().max(0));
    }

    #[allow(missing_docs)]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn backup_type(&self) -> BackupType {
        self.backup_type
    }

    #[allow(missing_docs)]
    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    #[allow(missing_docs)]
    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    #[allow(missing_docs)]
    pub fn status(&self) -> BackupStatus {
        self.status
    }

    /// When the record was created.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    #[allow(missing_docs)]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    #[allow(missing_docs)]
    pub fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
    }

    #[allow(missing_docs)]
    pub fn collections(&self) -> &[CollectionStats] {
        &self.collections
    }

    /// The size of the archive in bytes.
    pub fn backup_size(&self) -> Option<u64> {
        self.backup_size
    }

    #[allow(missing_docs)]
    pub fn compression_ratio(&self) -> Option<f64> {
        self.compression_ratio
    }

    #[allow(missing_docs)]
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    #[allow(missing_docs)]
    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    /// The local archive.
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// The reference of the remote copy, if one was made.
    pub fn cloud_path(&self) -> Option<&str> {
        self.cloud_path.as_deref()
    }

    #[allow(missing_docs)]
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    #[allow(missing_docs)]
    pub fn auto_delete_at(&self) -> DateTime<Utc> {
        self.auto_delete_at
    }

    #[allow(missing_docs)]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

/// Where a restore is in its lifecycle.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RestoreStatus {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for RestoreStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One restore attempt, kept for auditing and polling.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub id: String,
    pub backup_id: String,
    pub requested_by: String,
    pub options: RestoreOptions,
    pub status: RestoreStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub report: Option<RestoreReport>,
    pub error_message: Option<String>,
}

impl RestoreRecord {
    /// Create a pending restore of `backup_id`.
    pub fn new(
        backup_id: String,
        requested_by: String,
        options: RestoreOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!(
                "restore_{}_{}",
                now.timestamp_millis(),
                Uuid::new_v4().simple()
            ),
            backup_id,
            requested_by,
            options,
            status: RestoreStatus::Pending,
            start_time: now,
            end_time: None,
            duration_ms: None,
            report: None,
            error_message: None,
        }
    }

    /// If the restore has stopped running, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, RestoreStatus::Completed | RestoreStatus::Failed)
    }

    #[allow(missing_docs)]
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(RestoreStatus::InProgress, &[RestoreStatus::Pending])
    }

    #[allow(missing_docs)]
    pub fn complete(
        &mut self,
        report: RestoreReport,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RestoreStatus::Completed, &[RestoreStatus::InProgress])?;

        self.report = Some(report);
        self.finish(now);

        Ok(())
    }

    #[allow(missing_docs)]
    pub fn fail(&mut self, message: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(
            RestoreStatus::Failed,
            &[RestoreStatus::Pending, RestoreStatus::InProgress],
        )?;

        self.error_message = Some(message);
        self.finish(now);

        Ok(())
    }

    fn transition(
        &mut self,
        to: RestoreStatus,
        allowed_from: &[RestoreStatus],
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError::new("restore", self.status.as_str(), to.as_str()));
        }

        self.status = to;
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).num_milliseconds().max(0));
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
#[error("Cannot move a {record} from {from} to {to}")]
pub struct TransitionError {
    pub record: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

impl TransitionError {
    fn new(record: &'static str, from: &'static str, to: &'static str) -> Self {
        Self { record, from, to }
    }
}
