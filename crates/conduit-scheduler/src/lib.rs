//! Interval job scheduler for conduit.
//!
//! This crate provides the scheduling half of the engine:
//! - Jobs bind a registered action to an interval and an argument bag
//! - Every execution produces exactly one [`JobLog`]
//! - Rate-limit hints returned by actions push the next run out, never in
//! - At most one in-flight run per job unless parallel runs are allowed

mod action;
mod cleanup;
pub mod context;
mod error;
mod scheduler;
mod store;
mod types;

pub use action::{Action, ActionRegistry, ActionResult};
pub use cleanup::{CLEANUP_LOGS_ACTION, CleanupLogsAction, DEFAULT_LOG_RETENTION_DAYS};
pub use error::{ActionError, SchedulerError, StoreError};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{JobLogStore, JobStore, MemoryJobLogStore, MemoryJobStore};
pub use types::{
    Arguments, Job, JobLog, LogLevel, MAX_INTERVAL_SECS, RunRequest, round_up_to_minute,
};
