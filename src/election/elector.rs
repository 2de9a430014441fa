//! Leader Elector
//!
//! The election loop. While standing by it polls the lock record and takes
//! the lease once it is free or has lapsed; while leading it renews every
//! retry period and relinquishes leadership as soon as the renew deadline
//! passes without a successful renewal, whatever the store says.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::{jittered, Backoff};
use super::notifier::{LeaderEvent, Notifier, Observer};
use super::{ElectionConfig, ElectionPhase, ElectionState, StatusHandle};
use crate::error::{Error, Result};
use crate::lock::{LockEventKind, LockRecord, ResourceLock};

/// Result of one acquire-or-renew attempt
enum Attempt {
    /// We hold the lease after the attempt
    Held,
    /// Somebody else holds a valid lease
    HeldByOther,
    /// The write lost a race or the store failed
    Failed(Error),
}

/// Why a leadership term ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermEnd {
    /// No renewal succeeded within the renew deadline
    DeadlineExceeded,
    /// Another participant holds the lease
    Overtaken,
    /// The election was cancelled
    Cancelled,
}

/// Participant in a lease-based election
pub struct LeaderElector {
    lock: ResourceLock,
    config: ElectionConfig,
    observers: Vec<Observer>,
    state_tx: watch::Sender<ElectionState>,
}

impl LeaderElector {
    /// Create an elector for `lock`. Fails with `Config` if the timings or
    /// the identity are unusable.
    pub fn new(lock: ResourceLock, config: ElectionConfig) -> Result<Self> {
        config.validate()?;

        if lock.identity().is_empty() {
            return Err(Error::Config("participant identity cannot be empty".into()));
        }
        if lock.key().name.is_empty() {
            return Err(Error::Config("election name cannot be empty".into()));
        }
        if lock.key().namespace.is_empty() {
            return Err(Error::Config("election namespace cannot be empty".into()));
        }

        let (state_tx, _) = watch::channel(ElectionState::new(lock.identity(), lock.key()));

        Ok(Self {
            lock,
            config,
            observers: Vec::new(),
            state_tx,
        })
    }

    /// Register a callback for every leadership event
    pub fn add_observer<F>(&mut self, observer: F)
    where
        F: Fn(&LeaderEvent, &ElectionState) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
    }

    /// Handle for reading the latest snapshot
    pub fn status(&self) -> StatusHandle {
        StatusHandle::new(self.state_tx.subscribe())
    }

    /// Run the election until `cancel` fires. On cancellation a leader
    /// steps down, releases the lease if configured to, and returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let notifier = Notifier::start(self.observers)?;
        let state = self.state_tx.borrow().clone();

        let mut campaign = Campaign {
            backoff: Backoff::new(self.config.backoff_base, self.config.backoff_max),
            lock: self.lock,
            config: self.config,
            notifier,
            state_tx: self.state_tx,
            state,
            pending: Vec::new(),
        };

        campaign.run(cancel).await;
        Ok(())
    }
}

/// State owned by the running election loop
struct Campaign {
    lock: ResourceLock,
    config: ElectionConfig,
    notifier: Notifier,
    state_tx: watch::Sender<ElectionState>,
    state: ElectionState,
    backoff: Backoff,
    /// Events raised since the last commit
    pending: Vec<LeaderEvent>,
}

impl Campaign {
    async fn run(&mut self, cancel: CancellationToken) {
        tracing::info!(
            "Joining election {} as {} ({} store, lease {:?})",
            self.lock.key(),
            self.lock.identity(),
            self.lock.backend(),
            self.config.lease_duration
        );

        loop {
            let Some(acquired_at) = self.acquire(&cancel).await else {
                break;
            };

            match self.renew(&cancel, acquired_at).await {
                TermEnd::Cancelled => {
                    self.stop_leading();
                    self.set_phase(ElectionPhase::Standby);
                    self.commit();

                    if self.config.release_on_cancel {
                        self.release().await;
                    }
                    break;
                }
                end => self.lose(end),
            }
        }

        self.set_phase(ElectionPhase::Standby);
        self.commit();
        tracing::info!("Left election {}", self.lock.key());
    }

    /// Poll until we hold the lease. Returns when the winning attempt
    /// started, or `None` if cancelled first.
    async fn acquire(&mut self, cancel: &CancellationToken) -> Option<Instant> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // A win that took longer than the renew deadline is already
            // stale by our own clock, so it never counts
            let started = Instant::now();
            let deadline = started + self.config.renew_deadline;
            let attempt = match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Ok(attempt) => attempt,
                Err(_) => Attempt::Failed(Error::StoreUnavailable(format!(
                    "acquisition of {} ran past the renew deadline ({:?})",
                    self.lock.key(),
                    self.config.renew_deadline
                ))),
            };

            let delay = match attempt {
                Attempt::Held => {
                    self.backoff.reset();
                    self.start_leading();
                    self.set_phase(ElectionPhase::Leading);
                    self.commit();
                    tracing::info!("Acquired lease on {}", self.lock.key());
                    return Some(started);
                }
                Attempt::HeldByOther => {
                    self.set_phase(ElectionPhase::Standby);
                    self.commit();
                    jittered(self.config.retry_period)
                }
                Attempt::Failed(e) => {
                    self.set_phase(ElectionPhase::Standby);
                    self.commit();
                    let delay = self.backoff.next_delay();
                    if e.is_contention() {
                        tracing::debug!("Lost acquisition race on {}: {}", self.lock.key(), e);
                    } else {
                        tracing::warn!(
                            "Acquisition attempt {} failed: {} (retrying in {:?})",
                            self.backoff.failures(),
                            e,
                            delay
                        );
                    }
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Keep renewing until the renew deadline is missed, someone else takes
    /// the lease, or `cancel` fires
    async fn renew(&mut self, cancel: &CancellationToken, acquired_at: Instant) -> TermEnd {
        let mut last_renewal = acquired_at;

        loop {
            let deadline = last_renewal + self.config.renew_deadline;
            let next_attempt = (Instant::now() + self.config.retry_period).min(deadline);

            tokio::select! {
                _ = cancel.cancelled() => return TermEnd::Cancelled,
                _ = tokio::time::sleep_until(next_attempt) => {}
            }

            if Instant::now() >= deadline {
                return TermEnd::DeadlineExceeded;
            }

            self.set_phase(ElectionPhase::Renewing);
            self.commit();

            let started = Instant::now();
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Ok(Attempt::Held) => {
                    last_renewal = started;
                    self.set_phase(ElectionPhase::Leading);
                    self.commit();
                    tracing::trace!("Renewed lease on {}", self.lock.key());
                }
                Ok(Attempt::HeldByOther) => return TermEnd::Overtaken,
                Ok(Attempt::Failed(e)) => {
                    tracing::warn!("Failed to renew lease on {}: {}", self.lock.key(), e);
                }
                Err(_) => {
                    tracing::warn!("Renewal of {} ran past the renew deadline", self.lock.key());
                    return TermEnd::DeadlineExceeded;
                }
            }
        }
    }

    /// Give up leadership locally after a term ended without cancellation
    fn lose(&mut self, end: TermEnd) {
        self.set_phase(ElectionPhase::Lost);
        self.stop_leading();
        self.commit();

        if end == TermEnd::Overtaken {
            tracing::warn!(
                "Lost leadership of {}: lease taken over by {}",
                self.lock.key(),
                self.state.observed_leader
            );
        } else {
            tracing::warn!(
                "Lost leadership of {}: no renewal within {:?}",
                self.lock.key(),
                self.config.renew_deadline
            );
        }
    }

    /// Read the record and write it if it is ours or up for grabs
    async fn try_acquire_or_renew(&mut self) -> Attempt {
        let now = Utc::now();
        let identity = self.lock.identity().to_string();

        let current = match self.bounded(self.lock.get()).await {
            Ok(current) => current,
            Err(e) => return Attempt::Failed(e),
        };

        let Some(current) = current else {
            self.set_phase(ElectionPhase::Acquiring);
            self.commit();

            let record = LockRecord::new(
                self.lock.key().clone(),
                &identity,
                self.config.lease_duration,
                now,
            );
            return match self.bounded(self.lock.create(record)).await {
                Ok(stored) => {
                    self.observe(&stored);
                    Attempt::Held
                }
                Err(e) => {
                    if matches!(e, Error::AlreadyExists(_)) {
                        self.read_back().await;
                    }
                    Attempt::Failed(e)
                }
            };
        };

        self.observe(&current);

        let ours = current.is_held_by(&identity);
        if !ours && current.is_valid_at(now) {
            return Attempt::HeldByOther;
        }

        let mut next = current.clone();
        next.lease_duration = self.config.lease_duration;
        next.renew_time = now;
        let kind = if ours {
            LockEventKind::Renewed
        } else {
            self.set_phase(ElectionPhase::Acquiring);
            self.commit();

            next.holder_identity = identity;
            next.acquire_time = now;
            next.leader_transitions += 1;
            LockEventKind::Acquired
        };

        match self.bounded(self.lock.update(next, current.version, kind)).await {
            Ok(stored) => {
                self.observe(&stored);
                Attempt::Held
            }
            Err(e) => Attempt::Failed(e),
        }
    }

    /// After losing a creation race, learn who won right away instead of
    /// waiting for the next poll
    async fn read_back(&mut self) {
        match self.bounded(self.lock.get()).await {
            Ok(Some(winner)) => {
                self.observe(&winner);
                self.commit();
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Read-back of {} failed: {}", self.lock.key(), e),
        }
    }

    /// Clear the holder so another participant can take over immediately
    async fn release(&mut self) {
        let current = match self.bounded(self.lock.get()).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Could not read {} to release it: {}", self.lock.key(), e);
                return;
            }
        };

        if !current.is_held_by(self.lock.identity()) {
            return;
        }

        let mut released = current.clone();
        released.holder_identity.clear();
        released.renew_time = Utc::now();

        match self
            .bounded(self.lock.update(released, current.version, LockEventKind::Released))
            .await
        {
            Ok(stored) => {
                self.observe(&stored);
                self.commit();
                tracing::info!("Released lease on {}", self.lock.key());
            }
            Err(e) => tracing::warn!("Failed to release lease on {}: {}", self.lock.key(), e),
        }
    }

    /// Bound a store call by the configured store timeout
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreUnavailable(format!(
                "{} store call exceeded {:?}",
                self.lock.backend(),
                self.config.store_timeout
            ))),
        }
    }

    fn observe(&mut self, record: &LockRecord) {
        self.state.leader_transitions = record.leader_transitions;

        if record.holder_identity == self.state.observed_leader {
            return;
        }

        self.state.observed_leader = record.holder_identity.clone();
        if !record.holder_identity.is_empty() {
            tracing::info!("{} is the leader of {}", record.holder_identity, record.key);
            self.pending
                .push(LeaderEvent::NewLeader(record.holder_identity.clone()));
        }
    }

    fn start_leading(&mut self) {
        if !self.state.is_leader {
            self.state.is_leader = true;
            self.pending.push(LeaderEvent::StartedLeading);
        }
    }

    fn stop_leading(&mut self) {
        if self.state.is_leader {
            self.state.is_leader = false;
            self.pending.push(LeaderEvent::StoppedLeading);
        }
    }

    fn set_phase(&mut self, phase: ElectionPhase) {
        if self.state.phase != phase {
            tracing::debug!("{}: {} -> {}", self.lock.key(), self.state.phase, phase);
            self.state.phase = phase;
        }
        if phase == ElectionPhase::Leading {
            self.state.last_renewed = Some(Utc::now());
        }
    }

    /// Publish the snapshot, then deliver the events raised while building it
    fn commit(&mut self) {
        self.state_tx.send_if_modified(|published| {
            if *published == self.state {
                false
            } else {
                *published = self.state.clone();
                true
            }
        });

        for event in self.pending.drain(..) {
            self.notifier.notify(event, &self.state);
        }
    }
}
