//! Transition Notifier
//!
//! Delivers leadership events to observers on a dedicated thread. The
//! election loop only enqueues; a slow, blocked or panicking observer
//! delays delivery and nothing else.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::ElectionState;
use crate::error::Result;

/// A leadership transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LeaderEvent {
    /// This participant became leader
    StartedLeading,
    /// This participant stopped being leader
    StoppedLeading,
    /// The observed leader changed to the given identity
    NewLeader(String),
}

impl std::fmt::Display for LeaderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderEvent::StartedLeading => write!(f, "STARTED_LEADING"),
            LeaderEvent::StoppedLeading => write!(f, "STOPPED_LEADING"),
            LeaderEvent::NewLeader(identity) => write!(f, "NEW_LEADER({})", identity),
        }
    }
}

/// Callback invoked for every event with the snapshot taken at the
/// transition
pub type Observer = Arc<dyn Fn(&LeaderEvent, &ElectionState) + Send + Sync>;

/// Undelivered events at which a stuck observer is reported
const BACKLOG_WARN: usize = 1024;

/// Queue feeding the dispatcher thread.
///
/// The queue is unbounded so that no transition is ever dropped. Events
/// are only raised on leadership changes, but an observer that never
/// returns keeps every later event queued; the backlog is logged each
/// time it crosses a multiple of `BACKLOG_WARN`.
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<(LeaderEvent, ElectionState)>,
    backlog: Arc<AtomicUsize>,
}

impl Notifier {
    /// Start the dispatcher thread. It exits once the notifier is dropped
    /// and every queued event has been delivered.
    pub(crate) fn start(observers: Vec<Observer>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(LeaderEvent, ElectionState)>();
        let backlog = Arc::new(AtomicUsize::new(0));
        let outstanding = Arc::clone(&backlog);

        std::thread::Builder::new()
            .name("wolflease-notifier".to_string())
            .spawn(move || {
                while let Some((event, state)) = rx.blocking_recv() {
                    for observer in &observers {
                        let delivered = catch_unwind(AssertUnwindSafe(|| observer(&event, &state)));
                        if delivered.is_err() {
                            tracing::error!("Observer panicked while handling {}", event);
                        }
                    }
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!("Notifier stopped");
            })?;

        Ok(Self { tx, backlog })
    }

    /// Queue `event` for delivery; never waits
    pub(crate) fn notify(&self, event: LeaderEvent, state: &ElectionState) {
        let queued = self.backlog.fetch_add(1, Ordering::SeqCst) + 1;
        if queued % BACKLOG_WARN == 0 {
            tracing::warn!(
                "{} leadership events waiting on observers; an observer may be blocked",
                queued
            );
        }

        if self.tx.send((event, state.clone())).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Notifier thread is gone, event dropped");
        }
    }

    /// Events queued or in delivery
    pub(crate) fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockKey;
    use std::time::Duration;

    fn state() -> ElectionState {
        ElectionState::new("p1", &LockKey::new("default", "web"))
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer: Observer = Arc::new(move |event: &LeaderEvent, _: &ElectionState| {
            let _ = tx.send(event.clone());
        });
        let notifier = Notifier::start(vec![observer]).unwrap();

        notifier.notify(LeaderEvent::NewLeader("p1".to_string()), &state());
        notifier.notify(LeaderEvent::StartedLeading, &state());
        notifier.notify(LeaderEvent::StoppedLeading, &state());

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                LeaderEvent::NewLeader("p1".to_string()),
                LeaderEvent::StartedLeading,
                LeaderEvent::StoppedLeading,
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let panicky: Observer = Arc::new(|event: &LeaderEvent, _: &ElectionState| {
            if *event == LeaderEvent::StartedLeading {
                panic!("observer failure");
            }
        });
        let recording: Observer = Arc::new(move |event: &LeaderEvent, _: &ElectionState| {
            let _ = tx.send(event.clone());
        });
        let notifier = Notifier::start(vec![panicky, recording]).unwrap();

        notifier.notify(LeaderEvent::StartedLeading, &state());
        notifier.notify(LeaderEvent::StoppedLeading, &state());

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(LeaderEvent::StartedLeading));
        assert_eq!(second, Some(LeaderEvent::StoppedLeading));
    }

    #[tokio::test]
    async fn test_blocked_observer_does_not_block_notify() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let blocking: Observer = Arc::new(move |_: &LeaderEvent, _: &ElectionState| {
            let _ = release_rx.lock().unwrap().recv();
        });
        let notifier = Notifier::start(vec![blocking]).unwrap();

        let started = std::time::Instant::now();
        for _ in 0..100 {
            notifier.notify(LeaderEvent::StartedLeading, &state());
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(notifier.backlog(), 100);

        // Unblocked, the queue drains
        drop(release_tx);
        for _ in 0..100 {
            if notifier.backlog() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.backlog(), 0);
    }
}
