//! # Shared
//! The shared components of the backup engine and its daemon.
//!

#![warn(missing_docs)]

mod failure;
mod logger;
mod tier;

pub use failure::{Failure, log_and_panic};
pub use logger::{LogConfig, LoggerError, init_logger};
pub use tier::Tier;
