//! Job log retention.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;

use crate::{Action, ActionError, ActionResult, Arguments, JobLogStore};

/// Registry key of [`CleanupLogsAction`].
pub const CLEANUP_LOGS_ACTION: &str = "conduit.cleanup_logs";

/// Retention window used when the job does not pass `retentionDays`.
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 30;

/// Purges job logs older than a retention window.
pub struct CleanupLogsAction {
    logs: Arc<dyn JobLogStore>,
    default_retention_days: u64,
}

impl CleanupLogsAction {
    pub fn new(logs: Arc<dyn JobLogStore>) -> Self {
        Self {
            logs,
            default_retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.default_retention_days = days;
        self
    }
}

#[async_trait]
impl Action for CleanupLogsAction {
    fn key(&self) -> &str {
        CLEANUP_LOGS_ACTION
    }

    async fn run(&self, arguments: &Arguments) -> Result<ActionResult, ActionError> {
        let days = match arguments.get("retentionDays") {
            None => self.default_retention_days,
            Some(value) => value.as_u64().ok_or_else(|| {
                ActionError::InvalidArguments(format!(
                    "retentionDays must be a non-negative integer, got {}",
                    value
                ))
            })?,
        };

        let cutoff = i64::try_from(days)
            .ok()
            .and_then(Duration::try_days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                ActionError::InvalidArguments(format!("retentionDays {} is out of range", days))
            })?;
        let purged = self.logs.purge_logs_before(cutoff).await?;

        info!(purged, retention_days = days, "purged expired job logs");

        Ok(
            ActionResult::success(format!("Purged {} job logs older than {} days", purged, days))
                .step(format!("Cutoff {}", cutoff.to_rfc3339())),
        )
    }
}
