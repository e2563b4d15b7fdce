//! Errors raised while wiring up and driving the engine.

use std::path::PathBuf;

use conduit_scheduler::{SchedulerError, StoreError};
use conduit_sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Opening or migrating the database failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A setting or seed entry is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}
