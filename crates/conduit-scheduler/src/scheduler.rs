//! Job scheduler implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context;
use crate::{
    ActionRegistry, ActionResult, Job, JobLog, JobLogStore, JobStore, LogLevel, RunRequest,
    SchedulerError,
};

/// Default number of concurrent job executions.
const DEFAULT_WORKER_COUNT: usize = 4;

/// Default upper bound on a single action run.
const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 300;

/// A stored claim older than this many action timeouts is taken over.
const STALE_CLAIM_FACTOR: u32 = 2;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum jobs executing at once across a tick.
    pub worker_count: usize,
    /// Deadline for a single `Action::run`.
    pub action_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            action_timeout: Duration::from_secs(DEFAULT_ACTION_TIMEOUT_SECS),
        }
    }
}

/// Removes a job id from the in-flight set when the run ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, ()>>,
    job_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.job_id);
    }
}

/// The job scheduler.
///
/// Cheap to clone; clones share stores, registry, worker pool and the
/// in-flight set.
#[derive(Clone)]
pub struct Scheduler {
    jobs: Arc<dyn JobStore>,
    logs: Arc<dyn JobLogStore>,
    actions: Arc<ActionRegistry>,
    config: SchedulerConfig,
    in_flight: Arc<DashMap<String, ()>>,
    workers: Arc<Semaphore>,
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        logs: Arc<dyn JobLogStore>,
        actions: ActionRegistry,
    ) -> Self {
        let config = SchedulerConfig::default();
        Self {
            jobs,
            logs,
            actions: Arc::new(actions),
            workers: Arc::new(Semaphore::new(config.worker_count)),
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.workers = Arc::new(Semaphore::new(config.worker_count.max(1)));
        self.config = config;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether an execution of the job is currently in flight.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.in_flight.contains_key(job_id)
    }

    /// Run a job now.
    pub async fn run(&self, request: RunRequest) -> Result<JobLog, SchedulerError> {
        self.run_at(request, Utc::now()).await
    }

    /// Run a job as if the clock read `now`.
    ///
    /// Returns the persisted job log. Errors are limited to persistence
    /// failures and [`SchedulerError::AlreadyRunning`]; everything the
    /// action does wrong ends up in the log.
    #[tracing::instrument(skip(self, request), fields(job_id = %request.job_id, forced = request.force_run))]
    pub async fn run_at(
        &self,
        request: RunRequest,
        now: DateTime<Utc>,
    ) -> Result<JobLog, SchedulerError> {
        let Some(job) = self.jobs.get_job(&request.job_id).await? else {
            return self.job_not_found(&request.job_id).await;
        };

        if job.allow_parallel_runs {
            return self.execute(job, request.force_run, now).await;
        }

        let _guard = self.claim(&job.id)?;
        let claimed_at = Utc::now();
        if !self
            .jobs
            .try_claim(&job.id, claimed_at, self.stale_claim_cutoff(claimed_at))
            .await?
        {
            debug!("job is claimed by another scheduler");
            return Err(SchedulerError::AlreadyRunning(job.id));
        }

        // Reload under the claim: a run that finished in between has moved the schedule.
        let result = match self.jobs.get_job(&job.id).await {
            Ok(Some(job)) => self.execute(job, request.force_run, now).await,
            Ok(None) => self.job_not_found(&job.id).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.jobs.release_claim(&job.id).await {
            error!(error = %e, "failed to release job claim");
        }

        result
    }

    async fn execute(
        &self,
        mut job: Job,
        forced: bool,
        now: DateTime<Utc>,
    ) -> Result<JobLog, SchedulerError> {
        let mut trace = vec![format!("Loaded job {} ({})", job.name, job.id)];
        if forced {
            trace.push("Run forced, skipping enabled and schedule checks".to_string());
        }

        if !forced && !job.enabled {
            warn!("job is disabled");
            trace.push("Job is disabled, not running".to_string());
            let log = self.log_for(&job, LogLevel::Warning, "This job is disabled", trace);
            return self.persist_log(log).await;
        }

        if !forced {
            if let Some(next_run) = job.next_run.filter(|next| *next > now) {
                warn!(next_run = %next_run, "job is not due yet");
                trace.push(format!("Next run is {}, not running", next_run.to_rfc3339()));
                let message = format!(
                    "Job is not scheduled to run until {}",
                    next_run.to_rfc3339()
                );
                let log = self.log_for(&job, LogLevel::Warning, message, trace);
                return self.persist_log(log).await;
            }
        }

        let action = match self.actions.resolve(&job.action) {
            Ok(action) => action,
            Err(e) => {
                error!(action = %job.action, "action could not be resolved");
                trace.push(format!("Could not resolve action {}", job.action));
                if !forced {
                    let next_run = job.calculate_next_run(now, None);
                    job.next_run = Some(next_run);
                    trace.push(format!("Next run at {}", next_run.to_rfc3339()));
                    self.jobs.save_job(&job).await?;
                }
                let log = self.log_for(&job, LogLevel::Error, e.to_string(), trace);
                return self.persist_log(log).await;
            }
        };
        trace.push(format!("Resolved action {}", job.action));

        let acting_as = job
            .user_id
            .clone()
            .filter(|_| context::acting_user().is_none());
        if let Some(user) = &acting_as {
            trace.push(format!("Acting as user {}", user));
        }

        let timeout = self.config.action_timeout;
        let started = Instant::now();
        let outcome = {
            let call = tokio::time::timeout(timeout, action.run(&job.arguments));
            match acting_as {
                Some(user) => context::act_as(user, call).await,
                None => call.await,
            }
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(error = %err, "action failed");
                ActionResult::from(err)
            }
            Err(_) => {
                error!(timeout_secs = timeout.as_secs(), "action timed out");
                ActionResult::error(format!("Action timed out after {}s", timeout.as_secs()))
            }
        };

        let ActionResult {
            level,
            message,
            trace: action_trace,
            next_run: rate_limit_reset,
        } = result;
        trace.extend(action_trace);

        job.record_run(now, forced, rate_limit_reset);

        if forced {
            trace.push("Schedule left unchanged".to_string());
        } else if !job.enabled {
            trace.push("Single-run job disabled".to_string());
        } else if let Some(next_run) = job.next_run {
            trace.push(format!("Next run at {}", next_run.to_rfc3339()));
        }

        self.jobs.save_job(&job).await?;

        let mut log = self.log_for(&job, level, message, trace);
        log.execution_time_ms = elapsed.as_millis() as u64;

        info!(
            level = %log.level,
            duration_ms = log.execution_time_ms,
            next_run = ?job.next_run,
            "job executed"
        );

        self.persist_log(log).await
    }

    /// Run every job due at `now` on the worker pool.
    ///
    /// Jobs whose previous execution is still in flight are skipped without
    /// a log. A job that queues for a worker runs as of the moment it got one.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobLog>, SchedulerError> {
        let mut due = self.jobs.due_jobs(now).await?;

        if due.is_empty() {
            debug!("no jobs due");
            return Ok(Vec::new());
        }

        due.sort_by_key(|job| !job.is_time_sensitive);
        info!(count = due.len(), "running due jobs");

        let mut runs = JoinSet::new();
        for job in due {
            let scheduler = self.clone();
            let workers = Arc::clone(&self.workers);
            let queued = tokio::time::Instant::now();
            runs.spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|_| SchedulerError::ShuttingDown)?;
                let started = after_wait(now, queued.elapsed());
                scheduler.run_at(RunRequest::new(job.id), started).await
            });
        }

        let mut logs = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(Ok(log)) => logs.push(log),
                Ok(Err(SchedulerError::AlreadyRunning(job_id))) => {
                    debug!(%job_id, "skipping job already in flight");
                }
                Ok(Err(e)) => error!(error = %e, "job run failed"),
                Err(e) => error!(error = %e, "job task panicked"),
            }
        }

        Ok(logs)
    }

    /// Tick on a fixed cadence until shutdown.
    ///
    /// Each tick runs in its own task so a slow job never delays the next
    /// tick. In-flight runs are awaited before returning.
    pub async fn run_loop(&self, tick_interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(tick_secs = tick_interval.as_secs(), "scheduler starting");

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    ticks.spawn(async move { scheduler.tick(Utc::now()).await });
                }

                Some(finished) = ticks.join_next(), if !ticks.is_empty() => {
                    report_tick(finished);
                }
            }
        }

        if !ticks.is_empty() {
            info!(pending = ticks.len(), "waiting for in-flight ticks");
        }
        while let Some(finished) = ticks.join_next().await {
            report_tick(finished);
        }

        info!("scheduler shut down gracefully");
    }

    async fn job_not_found(&self, job_id: &str) -> Result<JobLog, SchedulerError> {
        error!("job not found");
        let log = JobLog::new(job_id, LogLevel::Error, format!("Job with id {} not found", job_id))
            .with_trace(vec![format!("Looked up job {}", job_id)]);
        self.persist_log(log).await
    }

    /// Claims taken before this instant belong to runs that died.
    fn stale_claim_cutoff(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.config
            .action_timeout
            .checked_mul(STALE_CLAIM_FACTOR)
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .and_then(|window| at.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn claim(&self, job_id: &str) -> Result<InFlightGuard, SchedulerError> {
        match self.in_flight.entry(job_id.to_string()) {
            Entry::Occupied(_) => Err(SchedulerError::AlreadyRunning(job_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    fn log_for(
        &self,
        job: &Job,
        level: LogLevel,
        message: impl Into<String>,
        trace: Vec<String>,
    ) -> JobLog {
        let mut log = JobLog::new(&job.id, level, message).with_trace(trace);
        log.arguments = job.arguments.clone();
        log.next_run = job.next_run;
        log
    }

    async fn persist_log(&self, log: JobLog) -> Result<JobLog, SchedulerError> {
        self.logs.append_log(&log).await?;
        Ok(log)
    }
}

/// `now` advanced by the whole seconds a run spent waiting for a worker.
fn after_wait(now: DateTime<Utc>, waited: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(Duration::from_secs(waited.as_secs()))
        .ok()
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(now)
}

fn report_tick(finished: Result<Result<Vec<JobLog>, SchedulerError>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(logs)) if !logs.is_empty() => debug!(runs = logs.len(), "tick finished"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "tick failed"),
        Err(e) => error!(error = %e, "tick task panicked"),
    }
}
