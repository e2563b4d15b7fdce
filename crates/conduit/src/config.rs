//! Runtime settings and the JSON configuration file.
//!
//! Settings come from the command line (with environment fallbacks). The
//! configuration file describes what the engine works on: jobs and
//! synchronizations to seed, required fields for internal registers, field
//! mappings, and the REST API endpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use conduit_scheduler::{DEFAULT_LOG_RETENTION_DAYS, Job, MAX_INTERVAL_SECS, SchedulerConfig};
use conduit_sync::{FieldMapping, HashStrength, Synchronization, SynchronizerConfig};

use crate::error::AppError;

/// Default database location.
pub const DEFAULT_DB_PATH: &str = "conduit.db";

/// Default seconds between scheduler ticks.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Default timeout for outbound HTTP requests, in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: String,
    pub config_path: Option<PathBuf>,
    pub tick_interval: Duration,
    pub workers: usize,
    pub action_timeout: Duration,
    pub log_retention_days: u64,
    pub hash_strength: HashStrength,
    pub http_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            config_path: None,
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            workers: scheduler.worker_count,
            action_timeout: scheduler.action_timeout,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            hash_strength: HashStrength::default(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl Settings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_count: self.workers.max(1),
            action_timeout: self.action_timeout,
        }
    }

    pub fn synchronizer_config(&self) -> SynchronizerConfig {
        SynchronizerConfig {
            hash_strength: self.hash_strength,
        }
    }

    /// Load the configuration file, or an empty one when none is set.
    pub fn load_config(&self) -> Result<ConfigFile, AppError> {
        match &self.config_path {
            Some(path) => ConfigFile::load(path),
            None => Ok(ConfigFile::default()),
        }
    }
}

/// REST API handler settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub base_url: String,
    /// Overrides the process-wide HTTP timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Contents of the JSON configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub synchronizations: Vec<Synchronization>,
    /// Required fields per internal register.
    #[serde(default)]
    pub schemas: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AppError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| AppError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject entries the engine could never run.
    pub fn validate(&self) -> Result<(), AppError> {
        for job in &self.jobs {
            if job.action.trim().is_empty() {
                return Err(AppError::Config(format!("job '{}' has no action", job.name)));
            }
            if job.interval > MAX_INTERVAL_SECS {
                return Err(AppError::Config(format!(
                    "job '{}' interval {} exceeds {} seconds",
                    job.name, job.interval, MAX_INTERVAL_SECS
                )));
            }
        }

        for sync in &self.synchronizations {
            if let Some(mapping_id) = &sync.mapping_id
                && !self.mappings.iter().any(|m| &m.id == mapping_id)
            {
                return Err(AppError::Config(format!(
                    "synchronization '{}' references unknown mapping '{}'",
                    sync.name, mapping_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"{
            "jobs": [
                {"id": "job-1", "name": "people sync", "action": "conduit.synchronize",
                 "arguments": {"synchronizationId": "sync-1"}, "interval": 300,
                 "isTimeSensitive": true}
            ],
            "synchronizations": [
                {"id": "sync-1", "name": "people", "sourceType": "internal",
                 "sourceRef": "people", "targetType": "api", "targetRef": "/contacts",
                 "mappingId": "people-to-contacts"}
            ],
            "schemas": {"people": ["email"]},
            "mappings": [
                {"id": "people-to-contacts", "fields": {"email": "mail"}}
            ],
            "api": {"baseUrl": "https://crm.example.com"}
        }"#;

        let config: ConfigFile = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.jobs[0].interval, 300);
        assert!(config.jobs[0].enabled);
        assert!(config.jobs[0].is_time_sensitive);
        assert_eq!(config.synchronizations[0].target_ref, "/contacts");
        assert_eq!(config.schemas["people"], vec!["email".to_string()]);
        assert_eq!(config.api.unwrap().base_url, "https://crm.example.com");
    }

    #[test]
    fn test_unknown_mapping_rejected() {
        let raw = r#"{"synchronizations": [
            {"id": "s", "name": "s", "sourceType": "internal", "sourceRef": "a",
             "targetType": "internal", "targetRef": "b", "mappingId": "missing"}
        ]}"#;
        let config: ConfigFile = serde_json::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let raw = r#"{"jobs": [
            {"id": "j", "name": "rare", "action": "conduit.ping", "interval": 10000000000000000}
        ]}"#;
        let config: ConfigFile = serde_json::from_str(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AppError::Config(ref msg) if msg.contains("rare")));
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let err = ConfigFile::load(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_missing_config_is_empty() {
        let settings = Settings::default();
        let config = settings.load_config().unwrap();
        assert!(config.jobs.is_empty());
        assert_eq!(settings.scheduler_config().worker_count, 4);
    }
}
