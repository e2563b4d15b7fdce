//! Source and target handlers, and the registry that selects them by type.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::{SourceObject, SyncError};

/// Lazily yielded source objects. Restarted by calling
/// [`SourceHandler::objects`] again.
pub type ObjectStream<'a> = BoxStream<'a, Result<SourceObject, SyncError>>;

/// Something objects can be read from.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// The `source_type` this handler serves.
    fn source_type(&self) -> &str;

    /// Every object under `source_ref`, in source order.
    fn objects<'a>(&'a self, source_ref: &'a str) -> ObjectStream<'a>;

    /// Perform one read to check the source is reachable.
    async fn probe(&self, source_ref: &str) -> Result<(), SyncError> {
        match self.objects(source_ref).next().await {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

/// Something mapped objects can be written to.
#[async_trait]
pub trait TargetHandler: Send + Sync {
    /// The `target_type` this handler serves.
    fn target_type(&self) -> &str;

    /// Create (`target_id` unset) or update an object. Returns its target id.
    async fn write(
        &self,
        target_ref: &str,
        target_id: Option<&str>,
        object: &Value,
    ) -> Result<String, SyncError>;

    /// Remove an object. Removing something already gone is not an error.
    async fn remove(&self, target_ref: &str, target_id: &str) -> Result<(), SyncError>;
}

/// Type -> handler registry.
///
/// Handlers can be registered at any time; an unknown type only becomes an
/// error when a synchronization tries to use it.
#[derive(Default)]
pub struct HandlerRegistry {
    sources: DashMap<String, Arc<dyn SourceHandler>>,
    targets: DashMap<String, Arc<dyn TargetHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&self, handler: Arc<dyn SourceHandler>) -> Result<(), SyncError> {
        match self.sources.entry(handler.source_type().to_string()) {
            Entry::Occupied(entry) => Err(SyncError::Configuration(format!(
                "source type '{}' already has a handler",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn register_target(&self, handler: Arc<dyn TargetHandler>) -> Result<(), SyncError> {
        match self.targets.entry(handler.target_type().to_string()) {
            Entry::Occupied(entry) => Err(SyncError::Configuration(format!(
                "target type '{}' already has a handler",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn source(&self, source_type: &str) -> Result<Arc<dyn SourceHandler>, SyncError> {
        self.sources
            .get(source_type)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| {
                SyncError::Configuration(format!("no handler for source type '{}'", source_type))
            })
    }

    pub fn target(&self, target_type: &str) -> Result<Arc<dyn TargetHandler>, SyncError> {
        self.targets
            .get(target_type)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| {
                SyncError::Configuration(format!("no handler for target type '{}'", target_type))
            })
    }

    /// Registered source and target types, sorted.
    pub fn types(&self) -> (Vec<String>, Vec<String>) {
        let mut sources: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        let mut targets: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();
        sources.sort();
        targets.sort();
        (sources, targets)
    }
}
