//! Object mapping between source and target representations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{MappingDirection, SyncError};

/// Transforms one representation into another.
#[async_trait]
pub trait MappingService: Send + Sync {
    async fn execute(
        &self,
        mapping_id: &str,
        direction: MappingDirection,
        input: &Value,
    ) -> Result<Value, SyncError>;
}

/// Copies top-level fields under new names.
///
/// Keys not listed are dropped. Applied target-to-source, the renames run
/// in reverse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub id: String,
    /// Source field -> target field.
    pub fields: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.fields.insert(from.into(), to.into());
        self
    }

    pub fn apply(&self, direction: MappingDirection, input: &Value) -> Result<Value, SyncError> {
        let Some(object) = input.as_object() else {
            return Err(SyncError::Validation(format!(
                "mapping '{}' expects a JSON object",
                self.id
            )));
        };

        let mut output = Map::new();
        for (source_field, target_field) in &self.fields {
            let (from, to) = match direction {
                MappingDirection::SourceToTarget => (source_field, target_field),
                MappingDirection::TargetToSource => (target_field, source_field),
            };
            if let Some(value) = object.get(from) {
                output.insert(to.clone(), value.clone());
            }
        }

        Ok(Value::Object(output))
    }
}

/// [`MappingService`] over registered [`FieldMapping`]s.
#[derive(Default)]
pub struct FieldMappings {
    mappings: DashMap<String, FieldMapping>,
}

impl FieldMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mapping: FieldMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    pub fn with(self, mapping: FieldMapping) -> Self {
        self.insert(mapping);
        self
    }
}

#[async_trait]
impl MappingService for FieldMappings {
    async fn execute(
        &self,
        mapping_id: &str,
        direction: MappingDirection,
        input: &Value,
    ) -> Result<Value, SyncError> {
        let mapping = self
            .mappings
            .get(mapping_id)
            .ok_or_else(|| SyncError::Configuration(format!("unknown mapping '{}'", mapping_id)))?;
        mapping.apply(direction, input)
    }
}
