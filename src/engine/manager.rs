//! Manager: owns the controller's lifecycle.
//!
//! Without leader election the manager leads immediately. With it, each
//! leadership term gets a fresh queue, cache, watches and worker pool; when
//! the lease is lost they are stopped and the manager goes back to standby.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::health::HealthSignal;
use crate::leader::{LeaderElectionConfig, LeaderElector, LeaseStore, RenewOutcome};
use crate::queue::{WorkQueue, default_controller_limiter};
use crate::store::StateStore;
use crate::telemetry::metrics::ControllerMetrics;
use crate::watch::{ObjectCache, WatchConfig, WatchMultiplexer};

use super::control::{EngineConfig, ReconcileEngine};
use super::registry::{ReconcileContext, Reconciler, ReconcilerRegistry};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub engine: EngineConfig,
    pub watch: WatchConfig,
    /// `None` disables leader election.
    pub leader_election: Option<LeaderElectionConfig>,
    /// How long in-flight reconciles may run after a stop is requested.
    /// With leader election it is further capped by
    /// [`LeaderElectionConfig::step_down_budget`].
    pub shutdown_grace_period: Duration,
    pub heartbeat_interval: Duration,
    /// Per-identity failure backoff bounds.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            watch: WatchConfig::default(),
            leader_election: None,
            shutdown_grace_period: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

pub struct ManagerBuilder {
    store: Arc<dyn StateStore>,
    registry: ReconcilerRegistry,
    health: Option<Arc<HealthSignal>>,
    metrics: Option<Arc<ControllerMetrics>>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    config: ManagerConfig,
}

impl ManagerBuilder {
    pub fn reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Result<Self> {
        self.registry.register(reconciler)?;
        Ok(self)
    }

    pub fn health(mut self, health: Arc<HealthSignal>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn lease_store(mut self, lease_store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(lease_store);
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Manager> {
        if self.registry.is_empty() {
            return Err(Error::Config("no reconcilers registered".into()));
        }
        let metrics = self.metrics.unwrap_or_default();

        let elector = match (&self.config.leader_election, self.lease_store) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(Error::Config(
                    "leader election is enabled but no lease store was given".into(),
                ));
            }
            (Some(election), Some(lease_store)) => Some(Arc::new(
                LeaderElector::new(lease_store, election.clone())?
                    .with_metrics(Arc::clone(&metrics)),
            )),
        };

        Ok(Manager {
            store: self.store,
            registry: Arc::new(self.registry),
            health: self.health.unwrap_or_default(),
            metrics,
            elector,
            config: self.config,
        })
    }
}

pub struct Manager {
    store: Arc<dyn StateStore>,
    registry: Arc<ReconcilerRegistry>,
    health: Arc<HealthSignal>,
    metrics: Arc<ControllerMetrics>,
    elector: Option<Arc<LeaderElector>>,
    config: ManagerConfig,
}

impl Manager {
    pub fn builder(store: Arc<dyn StateStore>) -> ManagerBuilder {
        ManagerBuilder {
            store,
            registry: ReconcilerRegistry::new(),
            health: None,
            metrics: None,
            lease_store: None,
            config: ManagerConfig::default(),
        }
    }

    pub fn health(&self) -> &Arc<HealthSignal> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    pub fn elector(&self) -> Option<&Arc<LeaderElector>> {
        self.elector.as_ref()
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        self.health.set_ready(false);
        let heartbeat = self.spawn_heartbeat(cancel.child_token());

        match &self.elector {
            None => {
                self.metrics.set_leader(true);
                self.lead(cancel.clone()).await;
                self.metrics.set_leader(false);
            }
            Some(elector) => self.run_elected(elector, &cancel).await,
        }

        heartbeat.abort();
        info!("manager stopped");
    }

    async fn run_elected(&self, elector: &LeaderElector, cancel: &CancellationToken) {
        loop {
            if !elector.acquire(cancel).await {
                break;
            }

            let term = cancel.child_token();
            let leading = self.lead(term.clone());
            tokio::pin!(leading);

            let (outcome, finished) = tokio::select! {
                outcome = elector.renew(cancel) => (outcome, false),
                _ = &mut leading => (RenewOutcome::Cancelled, true),
            };
            term.cancel();
            if !finished {
                leading.await;
            }

            if outcome == RenewOutcome::Cancelled || cancel.is_cancelled() {
                break;
            }
            warn!("leadership lost, reconcilers stopped; returning to standby");
        }

        if let Err(e) = elector.release().await {
            error!(error = %e, "failed to release leader lease");
        }
    }

    /// One leadership term: watches plus workers until `term` is cancelled.
    async fn lead(&self, term: CancellationToken) {
        info!(kinds = ?self.registry.kinds(), "starting reconcilers");

        let limiter = default_controller_limiter(self.config.backoff_base, self.config.backoff_max);
        let queue = Arc::new(
            WorkQueue::new(Box::new(limiter)).with_metrics(Arc::clone(&self.metrics)),
        );
        let cache = Arc::new(ObjectCache::new());
        let ctx = ReconcileContext::new(Arc::clone(&self.store), Arc::clone(&cache));

        let engine = ReconcileEngine::new(
            Arc::clone(&queue),
            Arc::clone(&self.registry),
            ctx,
            self.config.engine.clone(),
        )
        .with_metrics(Arc::clone(&self.metrics));

        let watches = Arc::new(
            WatchMultiplexer::new(
                Arc::clone(&self.store),
                Arc::clone(&queue),
                cache,
                self.registry.kinds(),
                self.config.watch.clone(),
            )
            .with_metrics(Arc::clone(&self.metrics)),
        );
        let mut synced = watches.subscribe_synced();

        let watch_task = {
            let watches = Arc::clone(&watches);
            let term = term.clone();
            tokio::spawn(async move { watches.run(term).await })
        };
        let halt = CancellationToken::new();
        let engine_task = {
            let halt = halt.clone();
            tokio::spawn(async move { engine.run(halt).await })
        };

        tokio::select! {
            _ = term.cancelled() => {}
            ok = async { synced.wait_for(|synced| *synced).await.is_ok() } => {
                if ok {
                    self.health.set_ready(true);
                    info!("caches synced, ready");
                }
                term.cancelled().await;
            }
        }

        self.health.set_ready(false);
        info!("stopping reconcilers");

        let grace = self.drain_budget();
        if !queue.shut_down_with_drain(grace).await {
            warn!(
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                in_flight = queue.processing_len(),
                "grace period elapsed, aborting in-flight reconciles"
            );
            halt.cancel();
        }
        if let Err(e) = engine_task.await {
            error!(error = %e, "engine task failed");
        }
        if let Err(e) = watch_task.await {
            error!(error = %e, "watch task failed");
        }
    }

    /// How long in-flight reconciles may finish once a term ends. Under leader
    /// election this never outlasts the old lease, so no write lands after a
    /// peer may have taken over.
    fn drain_budget(&self) -> Duration {
        match &self.config.leader_election {
            Some(election) => self
                .config
                .shutdown_grace_period
                .min(election.step_down_budget()),
            None => self.config.shutdown_grace_period,
        }
    }

    fn spawn_heartbeat(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let health = Arc::clone(&self.health);
        let period = self.config.heartbeat_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => health.beat(),
                }
            }
        })
    }
}
