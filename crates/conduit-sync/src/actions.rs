//! Scheduler actions backed by the synchronization engine.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_scheduler::{Action, ActionError, ActionResult, Arguments};
use reqwest::Client;
use serde_json::Value;
use tracing::info;

use crate::handler::HandlerRegistry;
use crate::http::check_status;
use crate::{Outcome, SourceObject, SyncError, Synchronizer};

pub const SYNCHRONIZE_ACTION: &str = "conduit.synchronize";
pub const PING_ACTION: &str = "conduit.ping";
pub const WEBHOOK_ACTION: &str = "conduit.webhook";

fn required_str<'a>(arguments: &'a Arguments, key: &str) -> Result<&'a str, ActionError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ActionError::InvalidArguments(format!("{} is required", key)))
}

/// Runs a synchronization pass.
///
/// Arguments: `synchronizationId`, and optionally `object` (`{id, data}`)
/// to push a single object instead of enumerating the source.
pub struct SynchronizeAction {
    synchronizer: Arc<Synchronizer>,
}

impl SynchronizeAction {
    pub fn new(synchronizer: Arc<Synchronizer>) -> Self {
        Self { synchronizer }
    }
}

/// Turn a pass outcome into a job result.
pub fn outcome_result(outcome: Outcome) -> ActionResult {
    let summary = outcome.summary();
    let mut result = if outcome.aborted {
        ActionResult::warning(format!("Synchronization rate limited: {}", summary))
    } else if outcome.failed > 0 {
        ActionResult::warning(format!(
            "Synchronization finished with {} failed objects: {}",
            outcome.failed, summary
        ))
    } else {
        ActionResult::success(format!("Synchronized: {}", summary))
    };

    result.trace = outcome.trace;
    match outcome.rate_limit_reset {
        Some(reset_at) => result.not_before(reset_at),
        None => result,
    }
}

#[async_trait]
impl Action for SynchronizeAction {
    fn key(&self) -> &str {
        SYNCHRONIZE_ACTION
    }

    async fn run(&self, arguments: &Arguments) -> Result<ActionResult, ActionError> {
        let sync_id = required_str(arguments, "synchronizationId")?;
        let pushed = match arguments.get("object") {
            None | Some(Value::Null) => None,
            Some(object) => Some(
                serde_json::from_value::<SourceObject>(object.clone())
                    .map_err(|e| ActionError::InvalidArguments(format!("object: {}", e)))?,
            ),
        };

        let outcome = self.synchronizer.synchronize_by_id(sync_id, pushed).await?;
        Ok(outcome_result(outcome))
    }
}

/// Liveness probe: one read against a source.
///
/// Arguments: `sourceType`, `sourceRef`.
pub struct PingAction {
    handlers: Arc<HandlerRegistry>,
}

impl PingAction {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl Action for PingAction {
    fn key(&self) -> &str {
        PING_ACTION
    }

    async fn run(&self, arguments: &Arguments) -> Result<ActionResult, ActionError> {
        let source_type = required_str(arguments, "sourceType")?;
        let source_ref = required_str(arguments, "sourceRef")?;

        let source = self.handlers.source(source_type)?;
        source.probe(source_ref).await?;

        info!(source_type, source_ref, "source reachable");
        Ok(
            ActionResult::success(format!("Source {} {} is reachable", source_type, source_ref))
                .step(format!("Read from {} source {}", source_type, source_ref)),
        )
    }
}

/// Generic event hook: POSTs `payload` to `url`.
pub struct WebhookAction {
    http: Client,
}

impl WebhookAction {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Action for WebhookAction {
    fn key(&self) -> &str {
        WEBHOOK_ACTION
    }

    async fn run(&self, arguments: &Arguments) -> Result<ActionResult, ActionError> {
        let url = required_str(arguments, "url")?;
        let payload = arguments
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(SyncError::from)?;
        let status = response.status();
        check_status(response, &format!("POST {}", url)).await?;

        Ok(ActionResult::success(format!("Delivered webhook to {}", url))
            .step(format!("POST {} returned {}", url, status)))
    }
}
