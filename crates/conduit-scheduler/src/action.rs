//! Action dispatch.
//!
//! Actions are resolved by the string key persisted on a [`crate::Job`].
//! The registry is assembled once at startup and shared read-only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActionError, Arguments, LogLevel, SchedulerError};

/// Outcome of one action run, copied into the job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default)]
    pub trace: Vec<String>,
    /// Rate-limit reset hint. The scheduler will not run the job before it.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

fn default_message() -> String {
    "Success".to_string()
}

impl Default for ActionResult {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            message: default_message(),
            trace: Vec::new(),
            next_run: None,
        }
    }
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Warning,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Append a step to the trace.
    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.trace.push(step.into());
        self
    }

    /// Attach a rate-limit reset hint.
    pub fn not_before(mut self, reset_at: DateTime<Utc>) -> Self {
        self.next_run = Some(reset_at);
        self
    }
}

impl From<ActionError> for ActionResult {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::RateLimited { reset_at, message } => {
                ActionResult::warning(format!("Rate limited: {}", message))
                    .step(format!("Remote asked to retry after {}", reset_at.to_rfc3339()))
                    .not_before(reset_at)
            }
            other => ActionResult::error(other.to_string()),
        }
    }
}

/// A unit of schedulable work.
///
/// Implementations hold everything they need from construction and never
/// block indefinitely.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key jobs use to refer to this action.
    fn key(&self) -> &str;

    /// Run the action with the job's argument bag.
    async fn run(&self, arguments: &Arguments) -> Result<ActionResult, ActionError>;
}

/// Explicit key -> action registry.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its own key.
    pub fn register(&mut self, action: Arc<dyn Action>) -> Result<(), SchedulerError> {
        let key = action.key().to_string();
        if self.actions.contains_key(&key) {
            return Err(SchedulerError::DuplicateAction(key));
        }
        self.actions.insert(key, action);
        Ok(())
    }

    /// Builder form of [`ActionRegistry::register`].
    pub fn with(mut self, action: Arc<dyn Action>) -> Result<Self, SchedulerError> {
        self.register(action)?;
        Ok(self)
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Action>, SchedulerError> {
        self.actions
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownAction(key.to_string()))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.actions.keys().cloned().collect();
        keys.sort();
        keys
    }
}
