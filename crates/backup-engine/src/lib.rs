//! # backup-engine
//! Full snapshot backups of a document store: export, compress, checksum, retain and restore.
//!

pub mod archive;
pub mod archive_store;
pub mod catalog;
pub mod checksum;
pub mod config;
mod context;
pub mod export;
pub mod notify;
pub mod object_id;
pub mod pipeline;
pub mod record;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod size;
pub mod store;

pub use config::{Config, LoadConfigError};
pub use context::Context;
pub use service::{BackupService, ServiceError, ServiceSettings};
