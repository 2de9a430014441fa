//! Resource Lock
//!
//! One participant's handle on one election record: the store, the key,
//! the local identity and the audit recorder bundled together.

use std::sync::Arc;

use super::{EventRecorder, LockEventKind, LockKey, LockRecord, LockStore, LockVersion};
use crate::error::Result;

/// A participant's view of a single lock record
#[derive(Clone)]
pub struct ResourceLock {
    store: Arc<dyn LockStore>,
    key: LockKey,
    identity: String,
    recorder: EventRecorder,
}

impl ResourceLock {
    /// Create a new resource lock
    pub fn new(
        store: Arc<dyn LockStore>,
        key: LockKey,
        identity: String,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            store,
            key,
            identity,
            recorder,
        }
    }

    /// Key of the guarded record
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Local participant identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Backend label of the underlying store
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Read the record
    pub async fn get(&self) -> Result<Option<LockRecord>> {
        self.store.get(&self.key).await
    }

    /// Create the record, which makes us the holder
    pub async fn create(&self, record: LockRecord) -> Result<LockRecord> {
        let stored = self.store.create_if_absent(record).await?;
        self.recorder
            .record(LockEventKind::Acquired, &stored, &self.identity);
        Ok(stored)
    }

    /// Conditionally replace the record and report the write as `kind`
    pub async fn update(
        &self,
        record: LockRecord,
        expected: LockVersion,
        kind: LockEventKind,
    ) -> Result<LockRecord> {
        let stored = self.store.update_if_unchanged(record, expected).await?;
        self.recorder.record(kind, &stored, &self.identity);
        Ok(stored)
    }
}
