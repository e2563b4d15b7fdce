//! Contract-tracked synchronization for conduit.
//!
//! A [`Synchronization`] pairs a source with a target. The [`Synchronizer`]
//! walks the source, keeps one [`SynchronizationContract`] per source
//! object, and writes to the target only when content changed.
//!
//! ## Features
//!
//! - **Handlers**: source/target registry with internal store and REST API backends
//! - **Contracts**: hash-based change detection with configurable strength
//! - **Rate limiting**: 429 signals stop the pass and surface a reset time
//! - **Actions**: scheduler actions for synchronization, liveness and webhooks

pub mod actions;
mod error;
pub mod handler;
pub mod hash;
pub mod http;
pub mod internal;
pub mod mapping;
mod orchestrator;
pub mod store;
mod types;

pub use actions::{PING_ACTION, PingAction, SYNCHRONIZE_ACTION, SynchronizeAction, WEBHOOK_ACTION, WebhookAction};
pub use error::SyncError;
pub use handler::{HandlerRegistry, ObjectStream, SourceHandler, TargetHandler};
pub use hash::{HashStrength, content_hash};
pub use http::{API_TYPE, RestApiHandler};
pub use internal::{INTERNAL_TYPE, InternalHandler, MemoryObjectStore, ObjectStore};
pub use mapping::{FieldMapping, FieldMappings, MappingService};
pub use orchestrator::{Synchronizer, SynchronizerConfig};
pub use store::{ContractStore, MemoryContractStore, MemorySynchronizationStore, SynchronizationStore};
pub use types::*;
