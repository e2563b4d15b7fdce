//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key/value bag handed verbatim to an action.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Default interval for newly created jobs (one hour).
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;

/// Longest accepted interval (100 years). Longer ones are clamped.
pub const MAX_INTERVAL_SECS: u64 = 100 * 365 * 86_400;

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Registry key of the action this job runs.
    pub action: String,
    /// Arguments passed verbatim to the action.
    #[serde(default)]
    pub arguments: Arguments,
    /// Seconds between runs.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Disabled jobs only run when forced.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Single-run jobs disable themselves after their first scheduled run.
    #[serde(default)]
    pub single_run: bool,
    /// Time-sensitive jobs are started first within a tick.
    #[serde(default)]
    pub is_time_sensitive: bool,
    /// Whether several executions of this job may overlap.
    #[serde(default)]
    pub allow_parallel_runs: bool,
    /// User the action should act as.
    #[serde(default)]
    pub user_id: Option<String>,
    /// When this job last executed its action.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Earliest time this job is eligible to run again. `None` means now.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    /// When this job was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

impl Job {
    /// Create a new enabled interval job that is due immediately.
    pub fn new(name: impl Into<String>, action: impl Into<String>, interval: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            action: action.into(),
            arguments: Arguments::new(),
            interval,
            enabled: true,
            single_run: false,
            is_time_sensitive: false,
            allow_parallel_runs: false,
            user_id: None,
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
        }
    }

    /// Set a single argument.
    pub fn with_argument(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    /// Mark this job as single-run.
    pub fn single_run(mut self) -> Self {
        self.single_run = true;
        self
    }

    /// Check if this job is eligible to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_none_or(|next| next <= now)
    }

    /// Calculate the next run time after an execution at `now`.
    ///
    /// A rate-limit reset hint is rounded up to the next whole minute and
    /// only used when it lands later than the interval-based time.
    pub fn calculate_next_run(
        &self,
        now: DateTime<Utc>,
        rate_limit_reset: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        // A zero interval would schedule the job for the tick that just ran it.
        let secs = self.interval.clamp(1, MAX_INTERVAL_SECS) as i64;
        let scheduled = Duration::try_seconds(secs)
            .and_then(|interval| now.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        match rate_limit_reset.map(round_up_to_minute) {
            Some(reset) if reset > scheduled => reset,
            _ => scheduled,
        }
    }

    /// Record a finished execution.
    ///
    /// Forced runs only touch `last_run`; the schedule stays as it was.
    pub fn record_run(
        &mut self,
        now: DateTime<Utc>,
        forced: bool,
        rate_limit_reset: Option<DateTime<Utc>>,
    ) {
        self.last_run = Some(now);

        if forced {
            return;
        }

        if self.single_run {
            self.enabled = false;
        } else {
            self.next_run = Some(self.calculate_next_run(now, rate_limit_reset));
        }
    }
}

/// Round an instant up to the next whole minute.
///
/// Instants already on a minute boundary are returned unchanged.
pub fn round_up_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    let rem = secs.rem_euclid(60);

    if rem == 0 && at.timestamp_subsec_nanos() == 0 {
        return at;
    }

    DateTime::from_timestamp(secs - rem + 60, 0).unwrap_or(at)
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// The record of one scheduler execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub id: String,
    /// Job id, or the raw requested id when the job could not be found.
    pub job_id: String,
    pub level: LogLevel,
    pub message: String,
    /// Ordered narrative of what the run did.
    #[serde(default)]
    pub trace: Vec<String>,
    /// Wall-clock time spent inside the action, in milliseconds.
    #[serde(default)]
    pub execution_time_ms: u64,
    /// Arguments the action was invoked with.
    #[serde(default)]
    pub arguments: Arguments,
    /// The job's next run after this execution.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobLog {
    pub fn new(job_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            level,
            message: message.into(),
            trace: Vec::new(),
            execution_time_ms: 0,
            arguments: Arguments::new(),
            next_run: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// Scheduler entry point arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub job_id: String,
    /// Bypass the enabled and next-run checks, and leave the schedule alone.
    #[serde(default)]
    pub force_run: bool,
}

impl RunRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            force_run: false,
        }
    }

    pub fn forced(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            force_run: true,
        }
    }
}
