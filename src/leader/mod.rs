//! Lease-based leader election.
//!
//! At most one [`LeaderElector`] per lease name is [`LeaderState::Leading`] at
//! any instant. The holder renews every `retry_period`; a single failed
//! renewal drops it back to standby before the lease can expire elsewhere.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::LeaseRecord;
use crate::telemetry::metrics::ControllerMetrics;

pub use store::{LeaseStore, MemoryLeaseStore};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderState {
    /// Not leading; waiting for the next attempt.
    Standby,
    /// An acquisition attempt is in flight.
    Acquiring,
    /// Holding the lease.
    Leading,
}

impl LeaderState {
    pub fn can_transition_to(self, to: LeaderState) -> bool {
        use LeaderState::*;
        matches!(
            (self, to),
            (Standby, Acquiring)
                | (Acquiring, Leading)
                | (Acquiring, Standby) // attempt failed
                | (Leading, Standby) // renewal failed or released
        )
    }
}

impl std::fmt::Display for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaderState::Standby => "standby",
            LeaderState::Acquiring => "acquiring",
            LeaderState::Leading => "leading",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    /// Unique per process.
    pub identity: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// Upper bound on a single renewal attempt.
    pub renew_deadline: Duration,
    /// Pause between acquisition attempts and between renewals.
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(lease_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::Config("leader identity must not be empty".into()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Config(
                "lease duration must be greater than the renew deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::Config(
                "renew deadline must be greater than the retry period".into(),
            ));
        }
        Ok(())
    }

    /// How long a holder that has stopped renewing may keep working before a
    /// peer can take the lease: the last successful renewal can be up to one
    /// retry period plus one renew deadline old when the loss is noticed.
    pub fn step_down_budget(&self) -> Duration {
        self.lease_duration
            .saturating_sub(self.renew_deadline)
            .saturating_sub(self.retry_period)
    }
}

/// Why [`LeaderElector::renew`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Cancelled,
    Lost,
}

// ---------------------------------------------------------------------------
// Elector
// ---------------------------------------------------------------------------

pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: LeaderElectionConfig,
    lease_duration: chrono::Duration,
    state: watch::Sender<LeaderState>,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        let lease_duration = chrono::Duration::from_std(config.lease_duration)
            .map_err(|e| Error::Config(format!("lease duration out of range: {e}")))?;
        let (state, _) = watch::channel(LeaderState::Standby);
        Ok(Self {
            store,
            config,
            lease_duration,
            state,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leading(&self) -> bool {
        self.state() == LeaderState::Leading
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    fn transition(&self, to: LeaderState) {
        let from = self.state();
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "invalid leader state transition ignored");
            return;
        }
        debug!(%from, %to, "leader state transition");
        self.state.send_replace(to);
        if let Some(metrics) = &self.metrics {
            metrics.set_leader(to == LeaderState::Leading);
        }
    }

    /// One acquire-or-renew round against the lease store.
    ///
    /// Returns `Ok(true)` when this identity holds the lease afterwards,
    /// `Ok(false)` when another live holder owns it or a concurrent writer
    /// won the compare-and-swap.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let identity = &self.config.identity;
        let deadline = now + self.lease_duration;

        let Some(current) = self.store.get(&self.config.lease_name).await? else {
            let record = LeaseRecord {
                name: self.config.lease_name.clone(),
                holder_identity: identity.clone(),
                acquire_time: now,
                renew_deadline: deadline,
                lease_transitions: 0,
                version: 0,
            };
            return match self.store.create(&record).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_conflict() => Ok(false),
                Err(e) => Err(e),
            };
        };

        let held_by_us = current.is_held_by(identity);
        let vacant = current.holder_identity.is_empty() || current.is_expired(now);
        if !held_by_us && !vacant {
            debug!(holder = %current.holder_identity, "lease held by another instance");
            return Ok(false);
        }

        let mut next = current.clone();
        next.renew_deadline = deadline;
        if !held_by_us {
            next.holder_identity = identity.clone();
            next.acquire_time = now;
            next.lease_transitions = current.lease_transitions.saturating_add(1);
        }

        match self.store.update(&next).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Attempt every `retry_period` until leading. Returns `false` if
    /// cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "attempting to acquire leader lease"
        );
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            self.transition(LeaderState::Acquiring);
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    self.transition(LeaderState::Leading);
                    info!(lease = %self.config.lease_name, "acquired leader lease");
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "lease acquisition failed"),
            }
            self.transition(LeaderState::Standby);

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every `retry_period` while leading. The first failed renewal
    /// moves to standby and returns [`RenewOutcome::Lost`].
    pub async fn renew(&self, cancel: &CancellationToken) -> RenewOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let attempt = tokio::time::timeout(
                self.config.renew_deadline,
                self.try_acquire_or_renew(Utc::now()),
            )
            .await;
            match attempt {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => warn!(lease = %self.config.lease_name, "leader lease taken over"),
                Ok(Err(e)) => warn!(lease = %self.config.lease_name, error = %e, "lease renewal failed"),
                Err(_) => warn!(lease = %self.config.lease_name, "lease renewal timed out"),
            }
            self.transition(LeaderState::Standby);
            return RenewOutcome::Lost;
        }
    }

    /// Give the lease up so a peer can take over without waiting for expiry.
    pub async fn release(&self) -> Result<()> {
        let was_leading = self.is_leading();
        self.transition(LeaderState::Standby);
        if !was_leading {
            return Ok(());
        }

        let Some(current) = self.store.get(&self.config.lease_name).await? else {
            return Ok(());
        };
        if !current.is_held_by(&self.config.identity) {
            return Ok(());
        }
        let now = Utc::now();
        let mut released = current;
        released.holder_identity = String::new();
        released.renew_deadline = now;
        self.store.update(&released).await?;
        info!(lease = %self.config.lease_name, "released leader lease");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elector(store: &Arc<MemoryLeaseStore>, identity: &str) -> LeaderElector {
        let store: Arc<dyn LeaseStore> = Arc::clone(store) as Arc<dyn LeaseStore>;
        LeaderElector::new(store, LeaderElectionConfig::new("addon", identity)).unwrap()
    }

    #[test]
    fn state_transitions() {
        use LeaderState::*;
        assert!(Standby.can_transition_to(Acquiring));
        assert!(Acquiring.can_transition_to(Leading));
        assert!(Acquiring.can_transition_to(Standby));
        assert!(Leading.can_transition_to(Standby));
        assert!(!Standby.can_transition_to(Leading));
        assert!(!Leading.can_transition_to(Acquiring));
    }

    #[test]
    fn config_rejects_inverted_timings() {
        let mut config = LeaderElectionConfig::new("addon", "a");
        assert!(config.validate().is_ok());
        config.renew_deadline = config.lease_duration;
        assert!(config.validate().is_err());
        let mut config = LeaderElectionConfig::new("addon", "");
        config.retry_period = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn step_down_budget_ends_before_a_peer_can_lead() {
        let config = LeaderElectionConfig::new("addon", "a");
        assert_eq!(config.step_down_budget(), Duration::from_secs(3));

        let mut tight = config.clone();
        tight.renew_deadline = Duration::from_secs(14);
        tight.retry_period = Duration::from_secs(5);
        assert_eq!(tight.step_down_budget(), Duration::ZERO);
    }

    #[tokio::test]
    async fn only_one_holder_while_lease_is_fresh() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        let now = Utc::now();

        assert!(a.try_acquire_or_renew(now).await.unwrap());
        assert!(!b.try_acquire_or_renew(now).await.unwrap());
        assert!(!b.try_acquire_or_renew(now + chrono::Duration::seconds(14)).await.unwrap());

        let lease = store.snapshot("addon").unwrap();
        assert_eq!(lease.holder_identity, "a");
        assert_eq!(lease.lease_transitions, 0);
    }

    #[tokio::test]
    async fn expired_lease_changes_hands() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        let now = Utc::now();

        assert!(a.try_acquire_or_renew(now).await.unwrap());
        let later = now + chrono::Duration::seconds(16);
        assert!(b.try_acquire_or_renew(later).await.unwrap());

        let lease = store.snapshot("addon").unwrap();
        assert_eq!(lease.holder_identity, "b");
        assert_eq!(lease.acquire_time, later);
        assert_eq!(lease.lease_transitions, 1);

        // The old holder can no longer renew.
        assert!(!a.try_acquire_or_renew(later).await.unwrap());
    }

    #[tokio::test]
    async fn renewal_only_moves_the_deadline() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(&store, "a");
        let now = Utc::now();

        assert!(a.try_acquire_or_renew(now).await.unwrap());
        let first = store.snapshot("addon").unwrap();
        let later = now + chrono::Duration::seconds(5);
        assert!(a.try_acquire_or_renew(later).await.unwrap());
        let renewed = store.snapshot("addon").unwrap();

        assert_eq!(renewed.acquire_time, first.acquire_time);
        assert_eq!(renewed.lease_transitions, first.lease_transitions);
        assert_eq!(renewed.renew_deadline, later + chrono::Duration::seconds(15));
        assert!(renewed.version > first.version);
    }

    #[tokio::test]
    async fn stale_write_is_a_conflict() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let record = LeaseRecord {
            name: "addon".into(),
            holder_identity: "a".into(),
            acquire_time: now,
            renew_deadline: now,
            lease_transitions: 0,
            version: 0,
        };
        let stored = store.create(&record).await.unwrap();
        store.update(&stored).await.unwrap();
        let err = store.update(&stored).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.create(&record).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn release_hands_over_without_waiting() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        let cancel = CancellationToken::new();

        assert!(a.acquire(&cancel).await);
        assert_eq!(a.state(), LeaderState::Leading);
        a.release().await.unwrap();
        assert_eq!(a.state(), LeaderState::Standby);

        assert!(b.try_acquire_or_renew(Utc::now()).await.unwrap());
        assert_eq!(store.snapshot("addon").unwrap().holder_identity, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn renew_steps_down_when_lease_is_stolen() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(&store, "a");
        let cancel = CancellationToken::new();
        assert!(a.acquire(&cancel).await);

        // Another writer takes the lease out from under the holder.
        let mut stolen = store.snapshot("addon").unwrap();
        stolen.holder_identity = "intruder".into();
        stolen.renew_deadline = Utc::now() + chrono::Duration::seconds(60);
        store.update(&stolen).await.unwrap();

        assert_eq!(a.renew(&cancel).await, RenewOutcome::Lost);
        assert_eq!(a.state(), LeaderState::Standby);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_stops_on_cancel() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        let cancel = CancellationToken::new();
        assert!(a.acquire(&cancel).await);

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            waiter.cancel();
        });
        assert!(!b.acquire(&cancel).await);
        assert_eq!(b.state(), LeaderState::Standby);
    }
}
