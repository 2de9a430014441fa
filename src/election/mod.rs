//! Leader Election
//!
//! Lease-based election over a shared lock record. One participant at a
//! time holds the lease; it keeps it by renewing before the renew deadline
//! and everyone else watches the record until the lease lapses.

mod backoff;
mod elector;
mod notifier;

pub use backoff::Backoff;
pub use elector::LeaderElector;
pub use notifier::{LeaderEvent, Observer};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::lock::LockKey;

/// Ceiling for the failed-attempt backoff
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Lease used when nothing else is configured
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Phase of the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectionPhase {
    /// Not holding the lease, watching the record
    Standby,
    /// Writing the record to take the lease
    Acquiring,
    /// Holding a valid lease
    Leading,
    /// Holding the lease, renewal in flight
    Renewing,
    /// Renew deadline missed, leadership relinquished
    Lost,
}

impl std::fmt::Display for ElectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionPhase::Standby => write!(f, "STANDBY"),
            ElectionPhase::Acquiring => write!(f, "ACQUIRING"),
            ElectionPhase::Leading => write!(f, "LEADING"),
            ElectionPhase::Renewing => write!(f, "RENEWING"),
            ElectionPhase::Lost => write!(f, "LOST"),
        }
    }
}

/// Election timing configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// How long a lease is valid after its last renewal
    pub lease_duration: Duration,
    /// Time since the last successful renewal after which the leader gives up
    pub renew_deadline: Duration,
    /// Interval between attempts
    pub retry_period: Duration,
    /// First delay after a failed acquisition attempt
    pub backoff_base: Duration,
    /// Largest delay after repeated failed attempts
    pub backoff_max: Duration,
    /// Upper bound on a single store call
    pub store_timeout: Duration,
    /// Clear the holder on shutdown so others can take over at once
    pub release_on_cancel: bool,
}

impl ElectionConfig {
    /// Derive timings from a single lease TTL: renew within half the lease,
    /// retry four times per lease
    pub fn from_ttl(ttl: Duration) -> Self {
        let renew_deadline = ttl / 2;
        let retry_period = ttl / 4;
        Self {
            lease_duration: ttl,
            renew_deadline,
            retry_period,
            backoff_base: retry_period,
            backoff_max: DEFAULT_BACKOFF_MAX.max(retry_period),
            store_timeout: renew_deadline,
            release_on_cancel: true,
        }
    }

    /// Validate the timing invariants
    pub fn validate(&self) -> Result<()> {
        if self.retry_period.is_zero() {
            return Err(Error::Config("retry period must be positive".into()));
        }

        if self.renew_deadline >= self.lease_duration {
            return Err(Error::Config(format!(
                "renew deadline ({:?}) must be shorter than the lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }

        if self.retry_period >= self.renew_deadline {
            return Err(Error::Config(format!(
                "retry period ({:?}) must be shorter than the renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }

        if self.backoff_base.is_zero() || self.backoff_max < self.backoff_base {
            return Err(Error::Config(format!(
                "backoff must satisfy 0 < base ({:?}) <= max ({:?})",
                self.backoff_base, self.backoff_max
            )));
        }

        if self.store_timeout.is_zero() || self.store_timeout > self.renew_deadline {
            return Err(Error::Config(format!(
                "store timeout ({:?}) must be positive and at most the renew deadline ({:?})",
                self.store_timeout, self.renew_deadline
            )));
        }

        Ok(())
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self::from_ttl(DEFAULT_TTL)
    }
}

/// Snapshot of the local view of the election
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectionState {
    /// Local participant identity
    pub identity: String,
    /// Election name
    pub election: String,
    /// Election namespace
    pub namespace: String,
    /// Current phase
    pub phase: ElectionPhase,
    /// Holder seen in the most recent read (empty if unknown or released)
    pub observed_leader: String,
    /// Whether this participant currently holds a valid lease
    pub is_leader: bool,
    /// Leadership changes recorded on the lock
    pub leader_transitions: u64,
    /// Last successful acquisition or renewal by this participant
    pub last_renewed: Option<DateTime<Utc>>,
}

impl ElectionState {
    /// Initial state for `identity` competing for `key`
    pub fn new(identity: &str, key: &LockKey) -> Self {
        Self {
            identity: identity.to_string(),
            election: key.name.clone(),
            namespace: key.namespace.clone(),
            phase: ElectionPhase::Standby,
            observed_leader: String::new(),
            is_leader: false,
            leader_transitions: 0,
            last_renewed: None,
        }
    }
}

/// Read-only handle on the elector's latest snapshot.
///
/// Reads copy the snapshot out and never wait on the election loop.
#[derive(Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<ElectionState>,
}

impl StatusHandle {
    pub(crate) fn new(rx: watch::Receiver<ElectionState>) -> Self {
        Self { rx }
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> ElectionState {
        self.rx.borrow().clone()
    }

    /// Identity of the last observed leader
    pub fn leader(&self) -> String {
        self.rx.borrow().observed_leader.clone()
    }

    /// Whether the local participant is leading
    pub fn is_leader(&self) -> bool {
        self.rx.borrow().is_leader
    }

    /// Wait for the next published snapshot. Returns `false` once the
    /// elector is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ttl() {
        let config = ElectionConfig::from_ttl(Duration::from_secs(10));
        assert_eq!(config.renew_deadline, Duration::from_secs(5));
        assert_eq!(config.retry_period, Duration::from_millis(2500));
        assert_eq!(config.store_timeout, config.renew_deadline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_renew_deadline_must_be_shorter_than_lease() {
        let config = ElectionConfig {
            renew_deadline: Duration::from_secs(10),
            ..ElectionConfig::from_ttl(Duration::from_secs(10))
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_retry_must_be_shorter_than_renew_deadline() {
        let config = ElectionConfig {
            retry_period: Duration::from_secs(5),
            ..ElectionConfig::from_ttl(Duration::from_secs(10))
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(ElectionConfig::from_ttl(Duration::ZERO).validate().is_err());
    }

    #[tokio::test]
    async fn test_status_handle_follows_updates() {
        let key = LockKey::new("default", "web");
        let (tx, rx) = watch::channel(ElectionState::new("p1", &key));
        let mut status = StatusHandle::new(rx);
        assert_eq!(status.leader(), "");

        tx.send_modify(|state| {
            state.observed_leader = "p1".to_string();
            state.is_leader = true;
        });
        assert!(status.changed().await);
        assert_eq!(status.leader(), "p1");
        assert!(status.is_leader());

        drop(tx);
        assert!(!status.changed().await);
        // Last snapshot stays readable
        assert!(status.snapshot().is_leader);
    }

    #[test]
    fn test_store_timeout_bounded_by_renew_deadline() {
        let config = ElectionConfig {
            store_timeout: Duration::from_secs(6),
            ..ElectionConfig::from_ttl(Duration::from_secs(10))
        };
        assert!(config.validate().is_err());
    }
}
