//! Lock Record Module
//!
//! The durable record that says who currently holds leadership, and the
//! store interface used to read and conditionally write it. All writes are
//! guarded by optimistic concurrency on the record's version token.

mod audit;
mod memory;
mod resource;
mod sqlite;

pub use audit::{EventRecorder, LockEvent, LockEventKind};
pub use memory::MemoryLockStore;
pub use resource::ResourceLock;
pub use sqlite::SqliteLockStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifies a contested resource within a store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    /// Scope the election lives in
    pub namespace: String,
    /// Election name
    pub name: String,
}

impl LockKey {
    /// Create a new lock key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque version token used for conditional writes.
///
/// Stores assign versions; callers only ever hand back the version they
/// last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockVersion(u64);

impl LockVersion {
    pub(crate) const INITIAL: LockVersion = LockVersion(1);

    pub(crate) fn from_raw(raw: u64) -> Self {
        LockVersion(raw)
    }

    pub(crate) fn raw(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(&self) -> Self {
        LockVersion(self.0 + 1)
    }
}

impl std::fmt::Display for LockVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The leadership record held in the coordination store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Resource this record guards
    pub key: LockKey,
    /// Current holder (empty once released)
    pub holder_identity: String,
    /// How long the lease is valid after `renew_time`
    pub lease_duration: Duration,
    /// When the current holder first acquired the lease
    pub acquire_time: DateTime<Utc>,
    /// When the current holder last renewed the lease
    pub renew_time: DateTime<Utc>,
    /// Number of times leadership has changed hands
    pub leader_transitions: u64,
    /// Version observed when this record was read
    pub version: LockVersion,
}

impl LockRecord {
    /// Create a fresh record held by `holder` starting at `now`
    pub fn new(key: LockKey, holder: &str, lease_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key,
            holder_identity: holder.to_string(),
            lease_duration,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
            version: LockVersion::default(),
        }
    }

    /// Instant after which the lease may be taken over.
    ///
    /// `None` means the lease duration does not fit in a timestamp and
    /// the lease never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.lease_duration).ok()?;
        self.renew_time.checked_add_signed(lease)
    }

    /// Whether someone holds a lease that is still valid at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_released() {
            return false;
        }
        match self.expires_at() {
            Some(expiry) => now <= expiry,
            None => true,
        }
    }

    /// Whether the record has been explicitly released
    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }

    /// Whether `identity` is the recorded holder
    pub fn is_held_by(&self, identity: &str) -> bool {
        !identity.is_empty() && self.holder_identity == identity
    }
}

/// Coordination store holding lock records.
///
/// Implementations must make `create_if_absent` and `update_if_unchanged`
/// atomic with respect to every other writer of the same key.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Short backend label used in logs
    fn backend(&self) -> &'static str;

    /// Read the current record, `None` if no record exists
    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>>;

    /// Create the record; fails with `AlreadyExists` if one is present
    async fn create_if_absent(&self, record: LockRecord) -> Result<LockRecord>;

    /// Replace the record if its version still equals `expected`; fails
    /// with `Conflict` otherwise
    async fn update_if_unchanged(
        &self,
        record: LockRecord,
        expected: LockVersion,
    ) -> Result<LockRecord>;

    /// Persist an audit event. Failures are ignored by callers.
    async fn record_event(&self, _event: &LockEvent) -> Result<()> {
        Ok(())
    }
}
