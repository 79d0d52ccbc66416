use std::{fs::create_dir_all, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Level, subscriber::set_global_default};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{
        self,
        format::{DefaultFields, Format},
    },
    layer::SubscriberExt,
    registry,
};

/// Where logs are written and how verbose they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// The directory daily log files are written to.
    pub directory: PathBuf,

    /// The lowest level that is logged, e.g. `info` or `debug`.
    pub level: String,

    /// How many daily log files are kept.
    pub retained_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            level: "info".to_string(),
            retained_files: 90,
        }
    }
}

/// Create and set the global loggers, a daily rolling file and stdout.
pub fn init_logger(config: &LogConfig) -> Result<Vec<WorkerGuard>, LoggerError> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| LoggerError::Level(config.level.clone()))?;

    create_dir_all(&config.directory).map_err(LoggerError::CreateDirectory)?;

    let filter = tracing_subscriber::filter::Targets::new().with_default(level);

    // File layer
    let (file_guard, file_layer) = {
        let appender = RollingFileAppender::builder()
            .filename_prefix("backup-engine")
            .filename_suffix("log")
            .rotation(Rotation::DAILY)
            .max_log_files(config.retained_files)
            .build(&config.directory)?;

        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false);

        (guard, layer)
    };

    let (std_guard, std_layer) = stdout_layer();

    let registry = registry().with(file_layer).with(std_layer).with(filter);
    set_global_default(registry)?;

    Ok(vec![file_guard, std_guard])
}

/// A coloured stdout layer behind a non blocking writer.
pub(crate) fn stdout_layer<S>() -> (
    WorkerGuard,
    fmt::Layer<S, DefaultFields, Format, NonBlocking>,
) {
    let (writer, guard) = tracing_appender::non_blocking(io::stdout());

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(true)
        .with_target(false);

    (guard, layer)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Invalid log level '{0}'")]
    Level(String),

    #[error("Failed to create rolling appender:\n{0}")]
    CreateRollingAppender(#[from] tracing_appender::rolling::InitError),

    #[error("Failed to create log directory:\n{0}")]
    CreateDirectory(#[source] io::Error),

    #[error("Failed to set the global subscriber:\n{0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}
