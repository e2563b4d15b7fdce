//! Wiring: builds handler, mapping and action registries over one database
//! and hands back a ready scheduler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use conduit_scheduler::{
    ActionRegistry, CLEANUP_LOGS_ACTION, CleanupLogsAction, Job, JobStore, Scheduler,
};
use conduit_sync::{
    FieldMappings, HandlerRegistry, InternalHandler, PingAction, RestApiHandler, SyncError,
    SynchronizationStore, SynchronizeAction, Synchronizer, WebhookAction,
};

use crate::config::{ConfigFile, Settings};
use crate::db::Database;
use crate::error::AppError;

/// Interval of the log retention job created on first start.
const CLEANUP_INTERVAL_SECS: u64 = 86_400;

/// Everything a command needs to drive the engine.
pub struct Engine {
    pub db: Arc<Database>,
    pub handlers: Arc<HandlerRegistry>,
    pub synchronizer: Arc<Synchronizer>,
    pub scheduler: Scheduler,
}

/// Build the engine over `db`.
pub fn build(db: Arc<Database>, settings: &Settings, config: &ConfigFile) -> Result<Engine, AppError> {
    let handlers = Arc::new(HandlerRegistry::new());

    let internal = Arc::new(InternalHandler::new(db.clone()));
    for (register, fields) in &config.schemas {
        internal.set_schema(register.clone(), fields.clone());
    }
    handlers.register_source(internal.clone())?;
    handlers.register_target(internal)?;

    if let Some(api) = &config.api {
        let timeout = api
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(settings.http_timeout);
        let rest = Arc::new(RestApiHandler::new(api.base_url.clone(), timeout)?);
        handlers.register_source(rest.clone())?;
        handlers.register_target(rest)?;
        info!(base_url = %api.base_url, "REST API handler registered");
    }

    let mappings = FieldMappings::new();
    for mapping in &config.mappings {
        mappings.insert(mapping.clone());
    }

    let synchronizer = Arc::new(
        Synchronizer::new(handlers.clone(), db.clone(), db.clone(), Arc::new(mappings))
            .with_config(settings.synchronizer_config()),
    );

    let http = reqwest::Client::builder()
        .timeout(settings.http_timeout)
        .build()
        .map_err(SyncError::from)?;

    let actions = ActionRegistry::new()
        .with(Arc::new(
            CleanupLogsAction::new(db.clone()).with_retention_days(settings.log_retention_days),
        ))?
        .with(Arc::new(SynchronizeAction::new(synchronizer.clone())))?
        .with(Arc::new(PingAction::new(handlers.clone())))?
        .with(Arc::new(WebhookAction::new(http)))?;

    let (sources, targets) = handlers.types();
    debug!(?sources, ?targets, actions = ?actions.keys(), "registries built");

    let scheduler =
        Scheduler::new(db.clone(), db.clone(), actions).with_config(settings.scheduler_config());

    Ok(Engine {
        db,
        handlers,
        synchronizer,
        scheduler,
    })
}

/// What a seed pass stored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub jobs: usize,
    pub synchronizations: usize,
}

/// Store the jobs and synchronizations declared in `config`.
///
/// Re-seeding a known job keeps its `last_run` and `next_run`.
pub async fn seed(db: &Database, config: &ConfigFile) -> Result<SeedReport, AppError> {
    let mut report = SeedReport::default();

    for sync in &config.synchronizations {
        db.save_synchronization(sync).await?;
        report.synchronizations += 1;
    }

    for job in &config.jobs {
        let mut job = job.clone();
        if let Some(existing) = db.get_job(&job.id).await? {
            job.last_run = existing.last_run;
            job.next_run = existing.next_run;
        }
        db.save_job(&job).await?;
        report.jobs += 1;
    }

    info!(
        jobs = report.jobs,
        synchronizations = report.synchronizations,
        "seeded configuration"
    );
    Ok(report)
}

/// Make sure a log retention job exists. Returns whether one was created.
pub async fn ensure_cleanup_job(db: &Database) -> Result<bool, AppError> {
    let jobs = db.list_jobs().await?;
    if jobs.iter().any(|job| job.action == CLEANUP_LOGS_ACTION) {
        return Ok(false);
    }

    let job = Job::new("job log cleanup", CLEANUP_LOGS_ACTION, CLEANUP_INTERVAL_SECS);
    db.save_job(&job).await?;
    info!(job_id = %job.id, "created job log cleanup job");
    Ok(true)
}
