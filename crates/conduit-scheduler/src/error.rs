//! Error types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in scheduler operations.
///
/// Failures of the action itself never surface here; they are converted
/// into a [`crate::JobLog`] at the scheduler boundary.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An action with the same key is already registered.
    #[error("action already registered: {0}")]
    DuplicateAction(String),

    /// No action is registered under the key.
    #[error("no action registered for key: {0}")]
    UnknownAction(String),

    /// Another execution of the job is still in flight.
    #[error("job is already running: {0}")]
    AlreadyRunning(String),

    /// The worker pool was closed.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Errors returned by [`crate::Action::run`].
#[derive(Debug, Error)]
pub enum ActionError {
    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The action or something it depends on is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The argument bag is missing a value or has the wrong shape.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A remote system asked us to slow down.
    #[error("rate limited until {reset_at}: {message}")]
    RateLimited {
        /// Earliest instant the remote accepts requests again.
        reset_at: DateTime<Utc>,
        /// Human readable context.
        message: String,
    },

    /// Persistence failed inside the action.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors raised by record stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend reported an error.
    #[error("backend error: {0}")]
    Backend(String),

    /// A lock guarding the backend was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
