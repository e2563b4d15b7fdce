//! The internal object store, usable as both source and target.
//!
//! Objects live in named registers. A register may declare required
//! top-level fields; writes missing any of them are rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_scheduler::StoreError;
use dashmap::DashMap;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::handler::{ObjectStream, SourceHandler, TargetHandler};
use crate::{SourceObject, SyncError};

/// Handler type served by [`InternalHandler`].
pub const INTERNAL_TYPE: &str = "internal";

/// Register-scoped object persistence.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects in a register ordered by id. Unknown registers are empty.
    async fn list_objects(&self, register: &str) -> Result<Vec<(String, Value)>, StoreError>;

    async fn get_object(&self, register: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn put_object(&self, register: &str, id: &str, value: &Value) -> Result<(), StoreError>;

    /// Returns whether an object was removed.
    async fn delete_object(&self, register: &str, id: &str) -> Result<bool, StoreError>;
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    registers: DashMap<String, BTreeMap<String, Value>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, register: &str) -> usize {
        self.registers.get(register).map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(&self, register: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .registers
            .get(register)
            .map(|r| r.iter().map(|(id, v)| (id.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn get_object(&self, register: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .registers
            .get(register)
            .and_then(|r| r.get(id).cloned()))
    }

    async fn put_object(&self, register: &str, id: &str, value: &Value) -> Result<(), StoreError> {
        self.registers
            .entry(register.to_string())
            .or_default()
            .insert(id.to_string(), value.clone());
        Ok(())
    }

    async fn delete_object(&self, register: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .registers
            .get_mut(register)
            .map(|mut r| r.remove(id).is_some())
            .unwrap_or(false))
    }
}

/// Source and target handler over an [`ObjectStore`].
pub struct InternalHandler {
    store: Arc<dyn ObjectStore>,
    required: DashMap<String, Vec<String>>,
}

impl InternalHandler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            required: DashMap::new(),
        }
    }

    /// Declare the fields every object in `register` must carry.
    pub fn with_schema(self, register: impl Into<String>, fields: Vec<String>) -> Self {
        self.set_schema(register, fields);
        self
    }

    pub fn set_schema(&self, register: impl Into<String>, fields: Vec<String>) {
        self.required.insert(register.into(), fields);
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    fn validate(&self, register: &str, object: &Value) -> Result<(), SyncError> {
        let Some(map) = object.as_object() else {
            return Err(SyncError::Validation(format!(
                "objects in '{}' must be JSON objects",
                register
            )));
        };

        if let Some(required) = self.required.get(register) {
            let missing: Vec<&str> = required
                .iter()
                .filter(|field| map.get(field.as_str()).is_none_or(Value::is_null))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(SyncError::Validation(format!(
                    "'{}' requires {}",
                    register,
                    missing.join(", ")
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl SourceHandler for InternalHandler {
    fn source_type(&self) -> &str {
        INTERNAL_TYPE
    }

    fn objects<'a>(&'a self, source_ref: &'a str) -> ObjectStream<'a> {
        stream::once(async move {
            self.store
                .list_objects(source_ref)
                .await
                .map_err(|e| SyncError::SourceUnavailable(e.to_string()))
        })
        .map(|listed| match listed {
            Ok(objects) => stream::iter(
                objects
                    .into_iter()
                    .map(|(id, data)| Ok(SourceObject::new(id, data))),
            )
            .left_stream(),
            Err(e) => stream::iter(vec![Err(e)]).right_stream(),
        })
        .flatten()
        .boxed()
    }
}

#[async_trait]
impl TargetHandler for InternalHandler {
    fn target_type(&self) -> &str {
        INTERNAL_TYPE
    }

    async fn write(
        &self,
        target_ref: &str,
        target_id: Option<&str>,
        object: &Value,
    ) -> Result<String, SyncError> {
        self.validate(target_ref, object)?;

        let id = target_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.store.put_object(target_ref, &id, object).await?;

        debug!(register = %target_ref, id = %id, "wrote internal object");
        Ok(id)
    }

    async fn remove(&self, target_ref: &str, target_id: &str) -> Result<(), SyncError> {
        let removed = self.store.delete_object(target_ref, target_id).await?;
        debug!(register = %target_ref, id = %target_id, removed, "removed internal object");
        Ok(())
    }
}
