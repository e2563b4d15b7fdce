//! The synchronization orchestrator.
//!
//! A pass walks source objects in source order. Each object is hashed and
//! compared with its contract; unchanged objects are skipped, changed ones
//! are mapped and written, and the contract is only advanced after the
//! target accepted the write. Per-object failures are counted and the pass
//! carries on. A rate-limit signal stops the pass and is reported in the
//! [`Outcome`].

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::handler::{HandlerRegistry, TargetHandler};
use crate::hash::{HashStrength, content_hash};
use crate::mapping::MappingService;
use crate::store::{ContractStore, SynchronizationStore};
use crate::{ObjectEvent, Outcome, SourceObject, SyncError, Synchronization, WrittenState};

/// Orchestrator tuning.
#[derive(Debug, Clone, Default)]
pub struct SynchronizerConfig {
    pub hash_strength: HashStrength,
}

type PairKey = (String, String);

/// Drives synchronizations to completion.
pub struct Synchronizer {
    handlers: Arc<HandlerRegistry>,
    contracts: Arc<dyn ContractStore>,
    synchronizations: Arc<dyn SynchronizationStore>,
    mappings: Arc<dyn MappingService>,
    config: SynchronizerConfig,
    locks: DashMap<PairKey, Arc<Mutex<()>>>,
}

impl Synchronizer {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        contracts: Arc<dyn ContractStore>,
        synchronizations: Arc<dyn SynchronizationStore>,
        mappings: Arc<dyn MappingService>,
    ) -> Self {
        Self {
            handlers,
            contracts,
            synchronizations,
            mappings,
            config: SynchronizerConfig::default(),
            locks: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: SynchronizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Load a synchronization by id.
    pub async fn synchronization(&self, id: &str) -> Result<Synchronization, SyncError> {
        self.synchronizations
            .get_synchronization(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("synchronization {}", id)))
    }

    /// Run one pass, over every source object or just `pushed`.
    ///
    /// Errors are limited to failures that make the whole pass meaningless:
    /// unknown handler types, an unreadable source, a broken contract store.
    #[tracing::instrument(skip(self, sync, pushed), fields(sync_id = %sync.id, pushed = pushed.is_some()))]
    pub async fn synchronize(
        &self,
        sync: &Synchronization,
        pushed: Option<SourceObject>,
    ) -> Result<Outcome, SyncError> {
        let target = self.handlers.target(&sync.target_type)?;
        let mut outcome = Outcome::new(&sync.id);

        match pushed {
            Some(object) => {
                outcome.step(format!("Processing pushed object {}", object.id));
                self.process(sync, target.as_ref(), object, &mut outcome).await?;
            }
            None => {
                let source = self.handlers.source(&sync.source_type)?;
                outcome.step(format!(
                    "Enumerating {} source {}",
                    sync.source_type, sync.source_ref
                ));

                let mut objects = source.objects(&sync.source_ref);
                while let Some(next) = objects.next().await {
                    let object = match next {
                        Ok(object) => object,
                        Err(e) => match e.rate_limit_reset() {
                            Some(reset_at) => {
                                warn!(reset_at = %reset_at, "source rate limited, aborting pass");
                                outcome.abort(reset_at, &e);
                                break;
                            }
                            None => {
                                error!(error = %e, "source enumeration failed");
                                return Err(match e {
                                    SyncError::SourceUnavailable(_) | SyncError::Store(_) => e,
                                    other => SyncError::SourceUnavailable(other.to_string()),
                                });
                            }
                        },
                    };

                    if self
                        .process(sync, target.as_ref(), object, &mut outcome)
                        .await?
                        .is_break()
                    {
                        break;
                    }
                }
            }
        }

        info!(
            seen = outcome.seen,
            written = outcome.written,
            skipped = outcome.skipped,
            failed = outcome.failed,
            aborted = outcome.aborted,
            "synchronization pass finished"
        );
        outcome.step(format!("Finished: {}", outcome.summary()));

        Ok(outcome)
    }

    /// Load a synchronization and run one pass.
    pub async fn synchronize_by_id(
        &self,
        id: &str,
        pushed: Option<SourceObject>,
    ) -> Result<Outcome, SyncError> {
        let sync = self.synchronization(id).await?;
        self.synchronize(&sync, pushed).await
    }

    /// Remove the target object for a deleted source object.
    ///
    /// The contract is dropped only after the target removal succeeded.
    #[tracing::instrument(skip(self, sync), fields(sync_id = %sync.id))]
    pub async fn remove_object(
        &self,
        sync: &Synchronization,
        source_id: &str,
    ) -> Result<Outcome, SyncError> {
        let target = self.handlers.target(&sync.target_type)?;
        let mut outcome = Outcome::new(&sync.id);

        let lock = self.lock_for(&sync.id, source_id);
        let result = {
            let _guard = lock.lock().await;
            self.remove_locked(sync, target.as_ref(), source_id, &mut outcome)
                .await
        };
        drop(lock);
        self.release_lock(&sync.id, source_id);

        result.map(|()| outcome)
    }

    async fn remove_locked(
        &self,
        sync: &Synchronization,
        target: &dyn TargetHandler,
        source_id: &str,
        outcome: &mut Outcome,
    ) -> Result<(), SyncError> {
        let Some(contract) = self.contracts.get_contract(&sync.id, source_id).await? else {
            debug!(source_id, "no contract, nothing to remove");
            outcome.step(format!("No contract for {}, nothing to remove", source_id));
            return Ok(());
        };

        if let Some(target_id) = &contract.target_id {
            match target.remove(&sync.target_ref, target_id).await {
                Ok(()) => outcome.step(format!("Removed target object {}", target_id)),
                Err(e) => {
                    if let Some(reset_at) = e.rate_limit_reset() {
                        outcome.abort(reset_at, &e);
                    } else if e.aborts_batch() {
                        return Err(e);
                    } else {
                        outcome.fail(source_id, &e);
                    }
                    return Ok(());
                }
            }
        }

        self.contracts.delete_contract(&sync.id, source_id).await?;
        outcome.removed += 1;
        info!(source_id, "removed synchronized object");
        Ok(())
    }

    /// Apply a pushed change to every synchronization watching its source.
    pub async fn handle_event(&self, event: ObjectEvent) -> Result<Vec<Outcome>, SyncError> {
        let (source_type, source_ref) = event.source();
        let watching = self
            .synchronizations
            .watching(source_type, source_ref)
            .await?;

        if watching.is_empty() {
            debug!(source_type, source_ref, "no synchronization watches this source");
        }

        let mut outcomes = Vec::with_capacity(watching.len());
        for sync in &watching {
            let outcome = match &event {
                ObjectEvent::Created { object, .. } | ObjectEvent::Updated { object, .. } => {
                    self.synchronize(sync, Some(object.clone())).await?
                }
                ObjectEvent::Deleted { source_id, .. } => self.remove_object(sync, source_id).await?,
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn process(
        &self,
        sync: &Synchronization,
        target: &dyn TargetHandler,
        object: SourceObject,
        outcome: &mut Outcome,
    ) -> Result<ControlFlow<()>, SyncError> {
        outcome.seen += 1;

        let lock = self.lock_for(&sync.id, &object.id);
        let result = {
            let _guard = lock.lock().await;
            self.process_locked(sync, target, &object, outcome).await
        };
        drop(lock);
        self.release_lock(&sync.id, &object.id);

        result
    }

    async fn process_locked(
        &self,
        sync: &Synchronization,
        target: &dyn TargetHandler,
        object: &SourceObject,
        outcome: &mut Outcome,
    ) -> Result<ControlFlow<()>, SyncError> {
        let now = Utc::now();
        let source_hash = content_hash(&object.data, self.config.hash_strength);
        let contract = self
            .contracts
            .ensure_contract(&sync.id, &object.id, now)
            .await?;

        if contract.is_current(&source_hash) {
            outcome.skipped += 1;
            debug!(source_id = %object.id, "unchanged, skipping");
            return Ok(ControlFlow::Continue(()));
        }

        let written = async {
            let mapped = self.map(sync, &object.data).await?;
            let target_id = target
                .write(&sync.target_ref, contract.target_id.as_deref(), &mapped)
                .await?;
            Ok::<_, SyncError>(WrittenState {
                source_hash,
                target_hash: content_hash(&mapped, self.config.hash_strength),
                target_id,
                synced_at: Utc::now(),
            })
        }
        .await;

        match written {
            Ok(written) => {
                let created = contract.target_id.is_none();
                self.contracts
                    .record_write(&sync.id, &object.id, &written)
                    .await?;
                outcome.written += 1;
                outcome.step(format!(
                    "{} {} as {}",
                    if created { "Created" } else { "Updated" },
                    object.id,
                    written.target_id
                ));
                Ok(ControlFlow::Continue(()))
            }
            Err(e) => {
                if let Some(reset_at) = e.rate_limit_reset() {
                    warn!(source_id = %object.id, reset_at = %reset_at, "target rate limited, aborting pass");
                    outcome.abort(reset_at, &e);
                    return Ok(ControlFlow::Break(()));
                }
                if e.aborts_batch() {
                    return Err(e);
                }
                warn!(source_id = %object.id, error = %e, "object failed");
                outcome.fail(&object.id, &e);
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn map(&self, sync: &Synchronization, data: &Value) -> Result<Value, SyncError> {
        match &sync.mapping_id {
            Some(mapping_id) => self.mappings.execute(mapping_id, sync.direction, data).await,
            None => Ok(data.clone()),
        }
    }

    fn lock_for(&self, sync_id: &str, source_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry((sync_id.to_string(), source_id.to_string()))
                .or_default()
                .value(),
        )
    }

    /// Drop the lock entry once nobody else holds a handle to it.
    fn release_lock(&self, sync_id: &str, source_id: &str) {
        self.locks
            .remove_if(&(sync_id.to_string(), source_id.to_string()), |_, lock| {
                Arc::strong_count(lock) == 1
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use futures_util::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::handler::{ObjectStream, SourceHandler};
    use crate::internal::{INTERNAL_TYPE, InternalHandler, MemoryObjectStore, ObjectStore};
    use crate::mapping::{FieldMapping, FieldMappings};
    use crate::store::{MemoryContractStore, MemorySynchronizationStore};
    use crate::{MappingDirection, SynchronizationContract};

    fn reset() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 30).unwrap()
    }

    /// What the scripted handlers should do.
    #[derive(Clone)]
    enum Step {
        Yield(SourceObject),
        RateLimit,
        Fail,
    }

    struct ScriptedSource(StdMutex<Vec<Step>>);

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(steps)))
        }

        fn set(&self, steps: Vec<Step>) {
            *self.0.lock().unwrap() = steps;
        }
    }

    #[async_trait]
    impl SourceHandler for ScriptedSource {
        fn source_type(&self) -> &str {
            "scripted"
        }

        fn objects<'a>(&'a self, _source_ref: &'a str) -> ObjectStream<'a> {
            let steps = self.0.lock().unwrap().clone();
            stream::iter(steps.into_iter().map(|step| match step {
                Step::Yield(object) => Ok(object),
                Step::RateLimit => Err(SyncError::RateLimited {
                    reset_at: reset(),
                    context: None,
                }),
                Step::Fail => Err(SyncError::TransientIo("connection refused".into())),
            }))
            .boxed()
        }
    }

    /// Counts writes per source id; fails or throttles on demand.
    #[derive(Default)]
    struct RecordingTarget {
        writes: StdMutex<Vec<Value>>,
        removed: StdMutex<Vec<String>>,
        fail_on: StdMutex<HashMap<String, SyncError>>,
        calls: AtomicUsize,
    }

    impl RecordingTarget {
        fn fail_with(&self, name: &str, err: SyncError) {
            self.fail_on.lock().unwrap().insert(name.to_string(), err);
        }

        fn clear_failures(&self) {
            self.fail_on.lock().unwrap().clear();
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    fn clone_err(err: &SyncError) -> SyncError {
        match err {
            SyncError::RateLimited { reset_at, context } => SyncError::RateLimited {
                reset_at: *reset_at,
                context: context.clone(),
            },
            SyncError::Validation(m) => SyncError::Validation(m.clone()),
            other => SyncError::TransientIo(other.to_string()),
        }
    }

    #[async_trait]
    impl TargetHandler for RecordingTarget {
        fn target_type(&self) -> &str {
            "recording"
        }

        async fn write(
            &self,
            _target_ref: &str,
            target_id: Option<&str>,
            object: &Value,
        ) -> Result<String, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = object["name"].as_str().unwrap_or_default().to_string();
            if let Some(err) = self.fail_on.lock().unwrap().get(&name) {
                return Err(clone_err(err));
            }
            self.writes.lock().unwrap().push(object.clone());
            Ok(target_id.map(str::to_string).unwrap_or_else(|| format!("t-{}", name)))
        }

        async fn remove(&self, _target_ref: &str, target_id: &str) -> Result<(), SyncError> {
            if let Some(err) = self.fail_on.lock().unwrap().get(target_id) {
                return Err(clone_err(err));
            }
            self.removed.lock().unwrap().push(target_id.to_string());
            Ok(())
        }
    }

    fn obj(id: &str, name: &str) -> SourceObject {
        SourceObject::new(id, json!({"id": id, "name": name}))
    }

    struct Harness {
        synchronizer: Synchronizer,
        source: Arc<ScriptedSource>,
        target: Arc<RecordingTarget>,
        contracts: Arc<MemoryContractStore>,
        syncs: Arc<MemorySynchronizationStore>,
        sync: Synchronization,
    }

    async fn harness(steps: Vec<Step>) -> Harness {
        let handlers = Arc::new(HandlerRegistry::new());
        let source = ScriptedSource::new(steps);
        let target = Arc::new(RecordingTarget::default());
        handlers.register_source(source.clone()).unwrap();
        handlers.register_target(target.clone()).unwrap();

        let contracts = Arc::new(MemoryContractStore::new());
        let syncs = Arc::new(MemorySynchronizationStore::new());
        let sync = Synchronization::new("people", "scripted", "people", "recording", "people");
        syncs.save_synchronization(&sync).await.unwrap();

        let synchronizer = Synchronizer::new(
            handlers,
            contracts.clone(),
            syncs.clone(),
            Arc::new(FieldMappings::new()),
        );

        Harness {
            synchronizer,
            source,
            target,
            contracts,
            syncs,
            sync,
        }
    }

    async fn contract(h: &Harness, source_id: &str) -> Option<SynchronizationContract> {
        h.contracts.get_contract(&h.sync.id, source_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_writes_everything() {
        let h = harness(vec![
            Step::Yield(obj("1", "a")),
            Step::Yield(obj("2", "b")),
        ])
        .await;

        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert_eq!((outcome.seen, outcome.written, outcome.skipped), (2, 2, 0));
        assert_eq!(h.contracts.len(), 2);
        let c = contract(&h, "1").await.unwrap();
        assert_eq!(c.target_id.as_deref(), Some("t-a"));
        assert!(c.last_synced.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_objects_skip_target_write() {
        let h = harness(vec![
            Step::Yield(obj("1", "a")),
            Step::Yield(obj("2", "b")),
            Step::Yield(obj("3", "c")),
        ])
        .await;
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        h.source.set(vec![
            Step::Yield(obj("1", "a")),
            Step::Yield(obj("2", "b")),
            Step::Yield(obj("3", "c2")),
        ]);
        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert_eq!(outcome.seen, 3);
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(h.target.write_count(), 4);
    }

    #[tokio::test]
    async fn test_update_reuses_target_id() {
        let h = harness(vec![Step::Yield(obj("1", "a"))]).await;
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        h.source.set(vec![Step::Yield(obj("1", "a2"))]);
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert_eq!(contract(&h, "1").await.unwrap().target_id.as_deref(), Some("t-a"));
        assert_eq!(h.contracts.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_contract_stale() {
        let h = harness(vec![
            Step::Yield(obj("x", "x")),
            Step::Yield(obj("y", "y")),
            Step::Yield(obj("z", "z")),
        ])
        .await;
        h.target.fail_with("x", SyncError::TransientIo("timeout".into()));

        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.failures[0].source_id, "x");
        let stale = contract(&h, "x").await.unwrap();
        assert!(stale.source_hash.is_none());
        assert!(stale.target_id.is_none());

        // The next pass retries it.
        h.target.clear_failures();
        let retry = h.synchronizer.synchronize(&h.sync, None).await.unwrap();
        assert_eq!((retry.written, retry.skipped), (1, 2));
    }

    #[tokio::test]
    async fn test_validation_failure_does_not_abort() {
        let h = harness(vec![Step::Yield(obj("1", "bad")), Step::Yield(obj("2", "ok"))]).await;
        h.target.fail_with("bad", SyncError::Validation("missing email".into()));

        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert_eq!((outcome.failed, outcome.written), (1, 1));
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn test_source_rate_limit_aborts_pass() {
        let h = harness(vec![
            Step::Yield(obj("1", "a")),
            Step::RateLimit,
            Step::Yield(obj("2", "b")),
        ])
        .await;

        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.rate_limit_reset, Some(reset()));
        assert_eq!(outcome.seen, 1);
        assert!(contract(&h, "2").await.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_at_start_processes_nothing() {
        let h = harness(vec![Step::RateLimit, Step::Yield(obj("1", "a"))]).await;

        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.seen, 0);
        assert_eq!(h.target.write_count(), 0);
    }

    #[tokio::test]
    async fn test_target_rate_limit_stops_remaining_objects() {
        let h = harness(vec![
            Step::Yield(obj("1", "a")),
            Step::Yield(obj("2", "b")),
            Step::Yield(obj("3", "c")),
        ])
        .await;
        h.target.fail_with(
            "b",
            SyncError::RateLimited {
                reset_at: reset(),
                context: None,
            },
        );

        let outcome = h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(h.target.calls.load(Ordering::SeqCst), 2);
        assert!(contract(&h, "3").await.is_none());
    }

    #[tokio::test]
    async fn test_source_failure_is_one_error() {
        let h = harness(vec![Step::Yield(obj("1", "a")), Step::Fail]).await;

        let err = h.synchronizer.synchronize(&h.sync, None).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_target_type_is_configuration_error() {
        let h = harness(vec![]).await;
        let mut sync = h.sync.clone();
        sync.target_type = "ftp".into();

        let err = h.synchronizer.synchronize(&sync, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_pushed_object_skips_enumeration() {
        let h = harness(vec![Step::Fail]).await;

        let outcome = h
            .synchronizer
            .synchronize(&h.sync, Some(obj("9", "pushed")))
            .await
            .unwrap();

        assert_eq!((outcome.seen, outcome.written), (1, 1));
    }

    #[tokio::test]
    async fn test_remove_object_drops_contract_after_target() {
        let h = harness(vec![Step::Yield(obj("1", "a"))]).await;
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        let outcome = h.synchronizer.remove_object(&h.sync, "1").await.unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(*h.target.removed.lock().unwrap(), vec!["t-a".to_string()]);
        assert!(contract(&h, "1").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_contract() {
        let h = harness(vec![Step::Yield(obj("1", "a"))]).await;
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();
        h.target.fail_with("t-a", SyncError::TransientIo("down".into()));

        let outcome = h.synchronizer.remove_object(&h.sync, "1").await.unwrap();

        assert_eq!((outcome.removed, outcome.failed), (0, 1));
        assert!(contract(&h, "1").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_unknown_object_is_noop() {
        let h = harness(vec![]).await;
        let outcome = h.synchronizer.remove_object(&h.sync, "ghost").await.unwrap();
        assert_eq!(outcome.removed, 0);
    }

    #[tokio::test]
    async fn test_events_share_contracts_with_polling() {
        let h = harness(vec![Step::Yield(obj("1", "a"))]).await;
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        // Same content pushed as an update: nothing to write.
        let outcomes = h
            .synchronizer
            .handle_event(ObjectEvent::Updated {
                source_type: "scripted".into(),
                source_ref: "people".into(),
                object: obj("1", "a"),
            })
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].skipped, 1);

        let outcomes = h
            .synchronizer
            .handle_event(ObjectEvent::Deleted {
                source_type: "scripted".into(),
                source_ref: "people".into(),
                source_id: "1".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcomes[0].removed, 1);
        assert!(h.contracts.is_empty());
    }

    #[tokio::test]
    async fn test_event_for_unwatched_source() {
        let h = harness(vec![]).await;
        let outcomes = h
            .synchronizer
            .handle_event(ObjectEvent::Created {
                source_type: "scripted".into(),
                source_ref: "elsewhere".into(),
                object: obj("1", "a"),
            })
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(h.syncs.list_synchronizations().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_passes_write_each_object_once() {
        let steps: Vec<Step> = (0..20)
            .map(|i| Step::Yield(obj(&i.to_string(), &format!("n{}", i))))
            .collect();
        let h = harness(steps).await;
        let synchronizer = Arc::new(h.synchronizer);

        let passes: Vec<_> = (0..4)
            .map(|_| {
                let synchronizer = Arc::clone(&synchronizer);
                let sync = h.sync.clone();
                tokio::spawn(async move { synchronizer.synchronize(&sync, None).await })
            })
            .collect();

        let mut written = 0;
        for pass in passes {
            written += pass.await.unwrap().unwrap().written;
        }

        assert_eq!(written, 20);
        assert_eq!(h.target.write_count(), 20);
        assert_eq!(h.contracts.len(), 20);
        assert!(synchronizer.locks.is_empty());
    }

    #[tokio::test]
    async fn test_mapping_and_internal_target() {
        let handlers = Arc::new(HandlerRegistry::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let internal = Arc::new(InternalHandler::new(objects.clone()));
        handlers.register_source(internal.clone()).unwrap();
        handlers.register_target(internal).unwrap();

        objects
            .put_object("crm", "c1", &json!({"fullName": "Ada", "secret": 1}))
            .await
            .unwrap();

        let mappings = FieldMappings::new().with(FieldMapping::new("crm").field("fullName", "name"));
        let syncs = Arc::new(MemorySynchronizationStore::new());
        let sync = Synchronization::new("crm", INTERNAL_TYPE, "crm", INTERNAL_TYPE, "people")
            .with_mapping("crm", MappingDirection::SourceToTarget);
        syncs.save_synchronization(&sync).await.unwrap();

        let synchronizer = Synchronizer::new(
            handlers,
            Arc::new(MemoryContractStore::new()),
            syncs,
            Arc::new(mappings),
        );

        let outcome = synchronizer.synchronize_by_id(&sync.id, None).await.unwrap();
        assert_eq!(outcome.written, 1);

        let people = objects.list_objects("people").await.unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].1, json!({"name": "Ada"}));
    }

    #[tokio::test]
    async fn test_unknown_synchronization() {
        let h = harness(vec![]).await;
        assert!(matches!(
            h.synchronizer.synchronize_by_id("missing", None).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_strength_change_rewrites_once() {
        let h = harness(vec![Step::Yield(obj("1", "a"))]).await;
        h.synchronizer.synchronize(&h.sync, None).await.unwrap();

        let stronger = Synchronizer {
            config: SynchronizerConfig {
                hash_strength: HashStrength::Sha512,
            },
            ..h.synchronizer
        };
        let first = stronger.synchronize(&h.sync, None).await.unwrap();
        let second = stronger.synchronize(&h.sync, None).await.unwrap();

        assert_eq!(first.written, 1);
        assert_eq!(second.skipped, 1);
    }
}
