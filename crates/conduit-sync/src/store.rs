//! Synchronization and contract persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_scheduler::StoreError;
use dashmap::DashMap;

use crate::{Synchronization, SynchronizationContract, WrittenState};

/// Persistence for synchronization definitions.
#[async_trait]
pub trait SynchronizationStore: Send + Sync {
    async fn get_synchronization(&self, id: &str) -> Result<Option<Synchronization>, StoreError>;

    async fn list_synchronizations(&self) -> Result<Vec<Synchronization>, StoreError>;

    /// Insert or replace a synchronization.
    async fn save_synchronization(&self, sync: &Synchronization) -> Result<(), StoreError>;

    /// Synchronizations reading from the given source.
    async fn watching(
        &self,
        source_type: &str,
        source_ref: &str,
    ) -> Result<Vec<Synchronization>, StoreError> {
        Ok(self
            .list_synchronizations()
            .await?
            .into_iter()
            .filter(|sync| sync.watches(source_type, source_ref))
            .collect())
    }
}

/// Persistence for synchronization contracts.
///
/// Every mutation is keyed on `(synchronization_id, source_id)` and must be
/// a single atomic upsert, never a read followed by a write.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn get_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
    ) -> Result<Option<SynchronizationContract>, StoreError>;

    /// Fetch the contract for the pair, creating it on first encounter.
    /// Refreshes `last_checked` either way.
    async fn ensure_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SynchronizationContract, StoreError>;

    /// Record a successful target write.
    async fn record_write(
        &self,
        synchronization_id: &str,
        source_id: &str,
        written: &WrittenState,
    ) -> Result<SynchronizationContract, StoreError>;

    /// Returns whether a contract was removed.
    async fn delete_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
    ) -> Result<bool, StoreError>;

    async fn contracts_for_synchronization(
        &self,
        synchronization_id: &str,
    ) -> Result<Vec<SynchronizationContract>, StoreError>;
}

/// In-memory synchronization store.
#[derive(Default)]
pub struct MemorySynchronizationStore {
    synchronizations: DashMap<String, Synchronization>,
}

impl MemorySynchronizationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SynchronizationStore for MemorySynchronizationStore {
    async fn get_synchronization(&self, id: &str) -> Result<Option<Synchronization>, StoreError> {
        Ok(self.synchronizations.get(id).map(|s| s.clone()))
    }

    async fn list_synchronizations(&self) -> Result<Vec<Synchronization>, StoreError> {
        let mut all: Vec<Synchronization> = self
            .synchronizations
            .iter()
            .map(|s| s.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn save_synchronization(&self, sync: &Synchronization) -> Result<(), StoreError> {
        self.synchronizations.insert(sync.id.clone(), sync.clone());
        Ok(())
    }
}

/// In-memory contract store.
#[derive(Default)]
pub struct MemoryContractStore {
    contracts: DashMap<(String, String), SynchronizationContract>,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

fn key(synchronization_id: &str, source_id: &str) -> (String, String) {
    (synchronization_id.to_string(), source_id.to_string())
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn get_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
    ) -> Result<Option<SynchronizationContract>, StoreError> {
        Ok(self
            .contracts
            .get(&key(synchronization_id, source_id))
            .map(|c| c.clone()))
    }

    async fn ensure_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SynchronizationContract, StoreError> {
        let contract = self
            .contracts
            .entry(key(synchronization_id, source_id))
            .and_modify(|c| c.last_checked = Some(now))
            .or_insert_with(|| SynchronizationContract::new(synchronization_id, source_id, now));
        Ok(contract.clone())
    }

    async fn record_write(
        &self,
        synchronization_id: &str,
        source_id: &str,
        written: &WrittenState,
    ) -> Result<SynchronizationContract, StoreError> {
        let mut contract = self
            .contracts
            .entry(key(synchronization_id, source_id))
            .or_insert_with(|| {
                SynchronizationContract::new(synchronization_id, source_id, written.synced_at)
            });
        contract.apply(written);
        Ok(contract.clone())
    }

    async fn delete_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .contracts
            .remove(&key(synchronization_id, source_id))
            .is_some())
    }

    async fn contracts_for_synchronization(
        &self,
        synchronization_id: &str,
    ) -> Result<Vec<SynchronizationContract>, StoreError> {
        let mut contracts: Vec<SynchronizationContract> = self
            .contracts
            .iter()
            .filter(|c| c.synchronization_id == synchronization_id)
            .map(|c| c.value().clone())
            .collect();
        contracts.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(contracts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn written(hash: &str) -> WrittenState {
        WrittenState {
            source_hash: hash.to_string(),
            target_hash: format!("t-{}", hash),
            target_id: "target-1".to_string(),
            synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = MemoryContractStore::new();
        let now = Utc::now();

        let first = store.ensure_contract("s", "o", now).await.unwrap();
        let second = store.ensure_contract("s", "o", now).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        assert!(first.source_hash.is_none());
    }

    #[tokio::test]
    async fn test_record_write_keeps_identity() {
        let store = MemoryContractStore::new();
        let created = store.ensure_contract("s", "o", Utc::now()).await.unwrap();

        let updated = store.record_write("s", "o", &written("abc")).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert!(updated.is_current("abc"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_scoping() {
        let store = MemoryContractStore::new();
        store.ensure_contract("s1", "o", Utc::now()).await.unwrap();
        store.ensure_contract("s2", "o", Utc::now()).await.unwrap();

        assert!(store.delete_contract("s1", "o").await.unwrap());
        assert!(!store.delete_contract("s1", "o").await.unwrap());

        assert!(store.contracts_for_synchronization("s1").await.unwrap().is_empty());
        assert_eq!(store.contracts_for_synchronization("s2").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_creates_one_contract() {
        let store = Arc::new(MemoryContractStore::new());
        let now = Utc::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.ensure_contract("s", "o", now).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_watching_filters_by_source() {
        let store = MemorySynchronizationStore::new();
        let a = Synchronization::new("a", "api", "/contacts", "internal", "contacts");
        let b = Synchronization::new("b", "api", "/orders", "internal", "orders");
        store.save_synchronization(&a).await.unwrap();
        store.save_synchronization(&b).await.unwrap();

        let watching = store.watching("api", "/contacts").await.unwrap();
        assert_eq!(watching, vec![a]);
    }
}
