//! Synchronization records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which way a synchronization's mapping is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDirection {
    #[default]
    SourceToTarget,
    TargetToSource,
}

impl MappingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingDirection::SourceToTarget => "source_to_target",
            MappingDirection::TargetToSource => "target_to_source",
        }
    }
}

impl fmt::Display for MappingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_to_target" => Ok(MappingDirection::SourceToTarget),
            "target_to_source" => Ok(MappingDirection::TargetToSource),
            other => Err(format!("unknown mapping direction '{}'", other)),
        }
    }
}

/// A source/target pairing kept consistent over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synchronization {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Selects the source handler.
    pub source_type: String,
    /// Handler-specific location of the source objects.
    pub source_ref: String,
    /// Selects the target handler.
    pub target_type: String,
    /// Handler-specific location of the target objects.
    pub target_ref: String,
    /// Mapping applied to each object. Objects pass through unchanged when unset.
    #[serde(default)]
    pub mapping_id: Option<String>,
    #[serde(default)]
    pub direction: MappingDirection,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Synchronization {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        source_ref: impl Into<String>,
        target_type: impl Into<String>,
        target_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            source_type: source_type.into(),
            source_ref: source_ref.into(),
            target_type: target_type.into(),
            target_ref: target_ref.into(),
            mapping_id: None,
            direction: MappingDirection::SourceToTarget,
            created_at: Utc::now(),
        }
    }

    pub fn with_mapping(mut self, mapping_id: impl Into<String>, direction: MappingDirection) -> Self {
        self.mapping_id = Some(mapping_id.into());
        self.direction = direction;
        self
    }

    /// Whether this synchronization reads from the given source.
    pub fn watches(&self, source_type: &str, source_ref: &str) -> bool {
        self.source_type == source_type && self.source_ref == source_ref
    }
}

/// Per-object bookkeeping for one synchronization.
///
/// At most one exists per `(synchronization_id, source_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationContract {
    pub id: String,
    pub synchronization_id: String,
    pub source_id: String,
    /// Hash of the source representation last written successfully.
    #[serde(default)]
    pub source_hash: Option<String>,
    /// Hash of the mapped representation last written.
    #[serde(default)]
    pub target_hash: Option<String>,
    /// Id of the target object, once created.
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SynchronizationContract {
    /// A fresh contract that has never been written.
    pub fn new(synchronization_id: impl Into<String>, source_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            synchronization_id: synchronization_id.into(),
            source_id: source_id.into(),
            source_hash: None,
            target_hash: None,
            target_id: None,
            last_checked: Some(now),
            last_synced: None,
            created_at: now,
        }
    }

    /// Whether `source_hash` matches what was last written.
    pub fn is_current(&self, source_hash: &str) -> bool {
        self.source_hash.as_deref() == Some(source_hash)
    }

    /// Record a successful target write.
    pub fn apply(&mut self, written: &WrittenState) {
        self.source_hash = Some(written.source_hash.clone());
        self.target_hash = Some(written.target_hash.clone());
        self.target_id = Some(written.target_id.clone());
        self.last_checked = Some(written.synced_at);
        self.last_synced = Some(written.synced_at);
    }
}

/// What a successful target write leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenState {
    pub source_hash: String,
    pub target_hash: String,
    pub target_id: String,
    pub synced_at: DateTime<Utc>,
}

/// An object yielded by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceObject {
    pub id: String,
    pub data: Value,
}

impl SourceObject {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// A change observed on a watched source, pushed instead of polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObjectEvent {
    Created {
        source_type: String,
        source_ref: String,
        object: SourceObject,
    },
    Updated {
        source_type: String,
        source_ref: String,
        object: SourceObject,
    },
    Deleted {
        source_type: String,
        source_ref: String,
        source_id: String,
    },
}

impl ObjectEvent {
    /// `(source_type, source_ref)` the event belongs to.
    pub fn source(&self) -> (&str, &str) {
        match self {
            ObjectEvent::Created {
                source_type,
                source_ref,
                ..
            }
            | ObjectEvent::Updated {
                source_type,
                source_ref,
                ..
            }
            | ObjectEvent::Deleted {
                source_type,
                source_ref,
                ..
            } => (source_type.as_str(), source_ref.as_str()),
        }
    }
}

/// A single object that could not be synchronized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFailure {
    pub source_id: String,
    pub error: String,
}

/// Result of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub synchronization_id: String,
    pub seen: usize,
    pub written: usize,
    /// Objects whose content had not changed.
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    /// The pass stopped early on a rate-limit signal.
    pub aborted: bool,
    #[serde(default)]
    pub rate_limit_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failures: Vec<ObjectFailure>,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl Outcome {
    pub fn new(synchronization_id: impl Into<String>) -> Self {
        Self {
            synchronization_id: synchronization_id.into(),
            ..Self::default()
        }
    }

    pub(crate) fn step(&mut self, step: impl Into<String>) {
        self.trace.push(step.into());
    }

    pub(crate) fn fail(&mut self, source_id: &str, error: impl fmt::Display) {
        self.failed += 1;
        let error = error.to_string();
        self.step(format!("Object {} failed: {}", source_id, error));
        self.failures.push(ObjectFailure {
            source_id: source_id.to_string(),
            error,
        });
    }

    pub(crate) fn abort(&mut self, reset_at: DateTime<Utc>, reason: impl fmt::Display) {
        self.aborted = true;
        self.rate_limit_reset = Some(reset_at);
        self.step(format!(
            "Rate limited ({}), stopping until {}",
            reason,
            reset_at.to_rfc3339()
        ));
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "seen={} written={} skipped={} failed={} removed={}",
            self.seen, self.written, self.skipped, self.failed, self.removed
        );
        if let Some(reset) = self.rate_limit_reset.filter(|_| self.aborted) {
            summary.push_str(&format!(", aborted until {}", reset.to_rfc3339()));
        }
        summary
    }
}
