//! WolfLease - Lease-Based Leader Election
//!
//! Elects a single leader among cooperating processes by contending for a
//! time-limited lease on a shared lock record.
//!
//! # Architecture
//!
//! Every participant runs a [`LeaderElector`] against the same
//! [`LockStore`](lock::LockStore). Writes are compare-and-swap on the
//! record version, so only one participant can take or extend the lease.
//! The holder keeps renewing; once it misses its renew deadline it steps
//! down locally, well before anyone else may take over.
//!
//! # Features
//!
//! - SQLite and in-memory lock stores
//! - Leadership transition callbacks delivered off the election loop
//! - Audit trail of acquisitions, renewals and releases
//! - HTTP status endpoints
//! - Graceful release on shutdown

pub mod api;
pub mod config;
pub mod election;
pub mod error;
pub mod lock;

pub use config::WolfLeaseConfig;
pub use election::LeaderElector;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfLeaseConfig;
    pub use crate::election::{
        ElectionConfig, ElectionPhase, ElectionState, LeaderElector, LeaderEvent, StatusHandle,
    };
    pub use crate::error::{Error, Result};
    pub use crate::lock::{LockKey, LockRecord, LockStore, MemoryLockStore, ResourceLock, SqliteLockStore};
}
