//! In-Memory Lock Store
//!
//! A process-local coordination store. Every participant that shares the
//! same `Arc<MemoryLockStore>` competes for the same records, which makes
//! it the store of choice for embedding and for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{LockEvent, LockKey, LockRecord, LockStore, LockVersion};
use crate::error::{Error, Result};

/// Maximum number of audit events retained
const MAX_EVENTS: usize = 1024;

/// Lock store backed by a hash map
#[derive(Default)]
pub struct MemoryLockStore {
    /// Records by key
    records: RwLock<HashMap<LockKey, LockRecord>>,
    /// Most recent audit events, oldest first
    events: RwLock<VecDeque<LockEvent>>,
    /// Fail every call with `StoreUnavailable` while set
    unavailable: AtomicBool,
    /// Artificial latency added to every call, in milliseconds
    latency_ms: AtomicU64,
}

impl MemoryLockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every call fails with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Simulate a slow store by delaying every call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Audit events recorded so far, oldest first
    pub async fn events(&self) -> Vec<LockEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    /// Remove a record, as an operator deleting it by hand would
    pub async fn remove(&self, key: &LockKey) -> Option<LockRecord> {
        self.records.write().await.remove(key)
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        self.enter().await?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn create_if_absent(&self, mut record: LockRecord) -> Result<LockRecord> {
        self.enter().await?;
        let mut records = self.records.write().await;
        if records.contains_key(&record.key) {
            return Err(Error::AlreadyExists(record.key.to_string()));
        }

        record.version = LockVersion::INITIAL;
        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn update_if_unchanged(
        &self,
        mut record: LockRecord,
        expected: LockVersion,
    ) -> Result<LockRecord> {
        self.enter().await?;
        let mut records = self.records.write().await;
        let current = match records.get(&record.key) {
            Some(current) if current.version == expected => current,
            _ => {
                return Err(Error::Conflict {
                    key: record.key.to_string(),
                    expected: expected.to_string(),
                })
            }
        };

        record.version = current.version.next();
        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn record_event(&self, event: &LockEvent) -> Result<()> {
        self.enter().await?;
        let mut events = self.events.write().await;
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(holder: &str) -> LockRecord {
        LockRecord::new(
            LockKey::new("default", "web"),
            holder,
            Duration::from_secs(10),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryLockStore::new();
        let key = LockKey::new("default", "web");
        assert!(store.get(&key).await.unwrap().is_none());

        let created = store.create_if_absent(record("p1")).await.unwrap();
        assert_eq!(created.version, LockVersion::INITIAL);

        let err = store.create_if_absent(record("p2")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let current = store.get(&key).await.unwrap().unwrap();
        assert_eq!(current.holder_identity, "p1");
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryLockStore::new();
        let created = store.create_if_absent(record("p1")).await.unwrap();

        let renewed = store
            .update_if_unchanged(created.clone(), created.version)
            .await
            .unwrap();
        assert_eq!(renewed.version, created.version.next());

        // Identical content, old version
        let err = store
            .update_if_unchanged(created.clone(), created.version)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_record_conflicts() {
        let store = MemoryLockStore::new();
        let err = store
            .update_if_unchanged(record("p1"), LockVersion::INITIAL)
            .await
            .unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let store = MemoryLockStore::new();
        store.set_unavailable(true);

        let err = store.get(&LockKey::new("default", "web")).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));

        store.set_unavailable(false);
        assert!(store.get(&LockKey::new("default", "web")).await.is_ok());
    }
}
