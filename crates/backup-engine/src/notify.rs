//! Reporting backup outcomes to an administrator.
//!

use core::fmt::Debug;

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    record::{BackupRecord, BackupStatus},
    size::{format_duration, format_file_size},
};

/// A message about the outcome of a backup.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub recipient: Option<String>,
    pub subject: String,
    pub message: String,
}

impl Notification {
    /// Describe the outcome of a finished backup.
    pub fn for_backup(record: &BackupRecord, recipient: Option<String>) -> Self {
        let succeeded = record.status() == BackupStatus::Completed;

        let subject = format!(
            "Backup {}: {}",
            if succeeded { "SUCCESS" } else { "FAILED" },
            record.name()
        );

        let message = if succeeded {
            format!(
                "Backup {} completed in {}, {} collections, {}",
                record.id(),
                format_duration(record.duration_ms()),
                record.collections().len(),
                format_file_size(record.backup_size().unwrap_or(0)),
            )
        } else {
            format!(
                "Backup {} {}: {}",
                record.id(),
                record.status(),
                record.error_message().unwrap_or("unknown error")
            )
        };

        Self {
            recipient,
            subject,
            message,
        }
    }
}

/// A channel notifications are delivered through.
pub trait Notifier: Debug + Send + Sync {
    /// Deliver a notification.
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match &notification.recipient {
            Some(recipient) => info!(
                "[Notify] to {recipient}: {}\n{}",
                notification.subject, notification.message
            ),
            None => info!("[Notify] {}\n{}", notification.subject, notification.message),
        }

        Ok(())
    }
}

/// Deliver a notification, logging instead of failing if delivery fails.
pub fn notify_or_warn(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(error) = notifier.notify(notification) {
        warn!("Failed to send notification '{}':\n{error}", notification.subject);
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
#[error("Failed to deliver the notification: {0}")]
pub struct NotifyError(pub String);
