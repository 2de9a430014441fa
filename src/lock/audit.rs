//! Lock Audit Events
//!
//! Best-effort record of successful lock writes. Events are queued without
//! waiting and written to the store by a background task; a full queue or
//! a failing store only costs the event, never the write it describes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{LockKey, LockRecord, LockStore};

/// Component name stamped on every event
pub const EVENT_COMPONENT: &str = "leader-elector";

/// Pending events before new ones are dropped
const EVENT_QUEUE_CAPACITY: usize = 256;

/// What kind of write an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockEventKind {
    /// Lease taken by a new holder
    Acquired,
    /// Lease extended by its holder
    Renewed,
    /// Lease given up by its holder
    Released,
}

impl std::fmt::Display for LockEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockEventKind::Acquired => write!(f, "ACQUIRED"),
            LockEventKind::Renewed => write!(f, "RENEWED"),
            LockEventKind::Released => write!(f, "RELEASED"),
        }
    }
}

/// A single audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Election the write touched
    pub key: LockKey,
    /// Kind of write
    pub kind: LockEventKind,
    /// Participant that performed the write
    pub identity: String,
    /// Reporting component
    pub component: String,
    /// Host the participant runs on
    pub host: String,
    /// When the write happened
    pub at: DateTime<Utc>,
}

impl LockEvent {
    /// Describe a successful write of `record` by `identity`
    pub fn new(kind: LockEventKind, record: &LockRecord, identity: &str, host: &str) -> Self {
        Self {
            key: record.key.clone(),
            kind,
            identity: identity.to_string(),
            component: EVENT_COMPONENT.to_string(),
            host: host.to_string(),
            at: Utc::now(),
        }
    }
}

/// Non-blocking handle for emitting audit events
#[derive(Clone)]
pub struct EventRecorder {
    tx: Option<mpsc::Sender<LockEvent>>,
    host: String,
}

impl EventRecorder {
    /// Start a drain task writing events into `store`.
    ///
    /// Must be called from within a tokio runtime. The task exits once
    /// every clone of the recorder has been dropped.
    pub fn spawn(store: Arc<dyn LockStore>, host: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<LockEvent>(EVENT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!(
                    target: "wolflease::audit",
                    "{} {} by {}",
                    event.kind,
                    event.key,
                    event.identity
                );
                if let Err(e) = store.record_event(&event).await {
                    tracing::debug!("Dropping audit event for {}: {}", event.key, e);
                }
            }
        });

        Self { tx: Some(tx), host }
    }

    /// A recorder that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            host: String::new(),
        }
    }

    /// Queue an event for a write of `record` by `identity`; never waits
    pub fn record(&self, kind: LockEventKind, record: &LockRecord, identity: &str) {
        let Some(tx) = &self.tx else {
            return;
        };

        if let Err(e) = tx.try_send(LockEvent::new(kind, record, identity, &self.host)) {
            tracing::trace!("Audit queue rejected event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use std::time::Duration;

    fn record() -> LockRecord {
        LockRecord::new(
            LockKey::new("default", "web"),
            "p1",
            Duration::from_secs(10),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_events_reach_store() {
        let store = Arc::new(MemoryLockStore::new());
        let recorder = EventRecorder::spawn(store.clone(), "host-a".to_string());

        recorder.record(LockEventKind::Acquired, &record(), "p1");
        recorder.record(LockEventKind::Renewed, &record(), "p1");

        let mut events = Vec::new();
        for _ in 0..50 {
            events = store.events().await;
            if events.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, LockEventKind::Acquired);
        assert_eq!(events[1].kind, LockEventKind::Renewed);
        assert_eq!(events[0].host, "host-a");
        assert_eq!(events[0].component, EVENT_COMPONENT);
    }

    #[tokio::test]
    async fn test_store_failure_is_ignored() {
        let store = Arc::new(MemoryLockStore::new());
        store.set_unavailable(true);
        let recorder = EventRecorder::spawn(store.clone(), "host-a".to_string());

        recorder.record(LockEventKind::Acquired, &record(), "p1");
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.set_unavailable(false);
        assert!(store.events().await.is_empty());
    }

    #[test]
    fn test_disabled_recorder() {
        EventRecorder::disabled().record(LockEventKind::Released, &record(), "p1");
    }
}
