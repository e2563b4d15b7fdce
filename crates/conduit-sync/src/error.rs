//! Error types for synchronization.

use chrono::{DateTime, Utc};
use conduit_scheduler::{ActionError, StoreError};
use thiserror::Error;

/// Errors that can occur while synchronizing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A synchronization, contract or remote object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The source or target asked us to slow down.
    #[error("rate limited until {reset_at}{}", context.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    RateLimited {
        /// Earliest instant the remote accepts requests again.
        reset_at: DateTime<Utc>,
        /// Where the signal came from.
        context: Option<String>,
    },

    /// Network failure or timeout talking to a source or target.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A handler type or mapping is not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The mapped object was rejected by the target.
    #[error("validation error: {0}")]
    Validation(String),

    /// The source could not be enumerated.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether this is a throttling signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. })
    }

    /// The reset instant carried by a throttling signal.
    pub fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncError::RateLimited { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    /// Whether this error must stop the rest of a pass.
    ///
    /// Everything else is recorded against the single object and the pass
    /// carries on.
    pub fn aborts_batch(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. }
                | SyncError::Configuration(_)
                | SyncError::SourceUnavailable(_)
                | SyncError::Store(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Validation(format!("undecodable response: {}", err))
        } else if err.is_builder() {
            SyncError::Configuration(err.to_string())
        } else {
            SyncError::TransientIo(err.to_string())
        }
    }
}

impl From<SyncError> for ActionError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(what) => ActionError::NotFound(what),
            SyncError::RateLimited { reset_at, context } => ActionError::RateLimited {
                reset_at,
                message: context.unwrap_or_else(|| "remote throttled the request".to_string()),
            },
            SyncError::Configuration(msg) => ActionError::Configuration(msg),
            SyncError::Store(e) => ActionError::Store(e),
            other => ActionError::Failed(other.to_string()),
        }
    }
}
