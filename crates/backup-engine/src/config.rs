//! Backup engine config
//!

use std::{collections::BTreeMap, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use shared::{LogConfig, Tier};
use thiserror::Error;

use crate::restore::IdentifierFields;

/// A remote copy target for archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// The directory archives are copied to.
    pub directory: PathBuf,
}

/// How many days backups are kept for.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub manual_days: u32,
    pub daily_days: u32,
    pub weekly_days: u32,
    pub monthly_days: u32,
}

impl RetentionConfig {
    /// The retention of an automatic backup of `tier`.
    pub fn for_tier(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Daily => self.daily_days,
            Tier::Weekly => self.weekly_days,
            Tier::Monthly => self.monthly_days,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            manual_days: 30,
            daily_days: 7,
            weekly_days: 30,
            monthly_days: 365,
        }
    }
}

/// How often each scheduled task runs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[allow(missing_docs)]
    pub daily_seconds: u64,

    #[allow(missing_docs)]
    pub weekly_seconds: u64,

    #[allow(missing_docs)]
    pub monthly_seconds: u64,

    /// How often expired backups are purged.
    pub cleanup_seconds: u64,

    /// The tiers that are backed up automatically.
    pub enabled: Vec<Tier>,
}

impl ScheduleConfig {
    /// The interval between backups of `tier`.
    pub fn interval(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Daily => self.daily_seconds,
            Tier::Weekly => self.weekly_seconds,
            Tier::Monthly => self.monthly_seconds,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_seconds: 60 * 60 * 24,
            weekly_seconds: 60 * 60 * 24 * 7,
            monthly_seconds: 60 * 60 * 24 * 30,
            cleanup_seconds: 60 * 60 * 24,
            enabled: Tier::ALL.to_vec(),
        }
    }
}

/// The backup engine's config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The directory of the document store.
    pub store_directory: PathBuf,

    /// The directory archives are kept in.
    pub backup_directory: PathBuf,

    /// The directory temporary export and extraction directories are created in.
    pub scratch_directory: PathBuf,

    /// The file backup and restore records are kept in.
    pub catalog_file: PathBuf,

    /// How long a single backup or restore may run for.
    pub pipeline_timeout_seconds: u64,

    /// The gzip level, 0 to 9.
    pub compression_level: u32,

    /// Who outcome notifications are addressed to.
    pub notify_email: Option<String>,

    #[allow(missing_docs)]
    pub log: LogConfig,

    /// Where archives are mirrored to, if anywhere.
    pub mirror: Option<MirrorConfig>,

    #[allow(missing_docs)]
    pub retention: RetentionConfig,

    #[allow(missing_docs)]
    pub schedule: ScheduleConfig,

    /// The identifier fields of each collection, as dot separated paths.
    pub identifier_fields: IdentifierFields,
}

impl Config {
    /// Tries to load a config from a toml file.
    pub fn load_toml(file_path: PathBuf) -> Result<Self, LoadConfigError> {
        if !file_path.exists() {
            return Err(LoadConfigError::NoFile);
        }

        let contents = fs::read_to_string(file_path).map_err(LoadConfigError::Read)?;
        let config = toml::from_str(&contents)?;

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_directory: PathBuf::from("./data"),
            backup_directory: PathBuf::from("./backups"),
            scratch_directory: PathBuf::from("./scratch"),
            catalog_file: PathBuf::from("./catalog.json"),
            pipeline_timeout_seconds: 60 * 60,
            compression_level: 9,
            notify_email: None,
            log: LogConfig::default(),
            mirror: None,
            retention: RetentionConfig::default(),
            schedule: ScheduleConfig::default(),
            identifier_fields: IdentifierFields::new(BTreeMap::from([
                (
                    "appointments".to_string(),
                    vec!["userId".to_string(), "docId".to_string()],
                ),
                (
                    "physicalfitnesses".to_string(),
                    vec!["examSessionId".to_string()],
                ),
            ])),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("The file does not exist.")]
    NoFile,

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to deserialize the file:\n{0}")]
    Deserialize(#[from] toml::de::Error),
}
