//! Controller metrics, exposed in Prometheus text format on `/metrics`.
//!
//! One [`ControllerMetrics`] is built at startup and shared (`Arc`) by the
//! queue, the watch multiplexer, the workers and the elector.

use parking_lot::Mutex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub kind: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
    pub class: String,
}

fn reconcile_histogram() -> Histogram {
    // 5ms .. ~40s
    Histogram::new(exponential_buckets(0.005, 2.0, 14))
}

pub struct ControllerMetrics {
    registry: Mutex<Registry>,
    /// Reconcile attempts by outcome. Labels: `kind`, `result`.
    pub reconcile_total: Family<ResultLabels, Counter>,
    /// Reconcile errors by class. Labels: `kind`, `class`.
    pub reconcile_errors: Family<ErrorLabels, Counter>,
    /// Reconcile latency in seconds. Labels: `kind`.
    pub reconcile_duration: Family<KindLabels, Histogram>,
    /// Identities ready for a worker.
    pub queue_depth: Gauge,
    /// Queue additions. Labels: `kind`.
    pub queue_adds: Family<KindLabels, Counter>,
    /// Rate-limited requeues. Labels: `kind`.
    pub queue_retries: Family<KindLabels, Counter>,
    /// Identities past the retry alert threshold or failing permanently.
    pub persistent_failures: Family<KindLabels, Counter>,
    /// Watch re-subscriptions after a broken stream. Labels: `kind`.
    pub watch_restarts: Family<KindLabels, Counter>,
    /// 1 while this instance is the active reconciler.
    pub leader_active: Gauge,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("addon_controller");

        let reconcile_total = Family::<ResultLabels, Counter>::default();
        let reconcile_errors = Family::<ErrorLabels, Counter>::default();
        let reconcile_duration: Family<KindLabels, Histogram> =
            Family::new_with_constructor(reconcile_histogram);
        let queue_depth = Gauge::default();
        let queue_adds = Family::<KindLabels, Counter>::default();
        let queue_retries = Family::<KindLabels, Counter>::default();
        let persistent_failures = Family::<KindLabels, Counter>::default();
        let watch_restarts = Family::<KindLabels, Counter>::default();
        let leader_active = Gauge::default();

        registry.register(
            "reconcile",
            "Reconcile attempts by outcome",
            reconcile_total.clone(),
        );
        registry.register(
            "reconcile_errors",
            "Reconcile errors by class",
            reconcile_errors.clone(),
        );
        registry.register(
            "reconcile_duration_seconds",
            "Reconcile latency in seconds",
            reconcile_duration.clone(),
        );
        registry.register(
            "workqueue_depth",
            "Identities ready for a worker",
            queue_depth.clone(),
        );
        registry.register("workqueue_adds", "Work queue additions", queue_adds.clone());
        registry.register(
            "workqueue_retries",
            "Rate-limited requeues",
            queue_retries.clone(),
        );
        registry.register(
            "persistent_failures",
            "Identities failing beyond the retry alert threshold",
            persistent_failures.clone(),
        );
        registry.register(
            "watch_restarts",
            "Watch re-subscriptions after a broken stream",
            watch_restarts.clone(),
        );
        registry.register(
            "leader_active",
            "1 while this instance is the active reconciler",
            leader_active.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            reconcile_total,
            reconcile_errors,
            reconcile_duration,
            queue_depth,
            queue_adds,
            queue_retries,
            persistent_failures,
            watch_restarts,
            leader_active,
        }
    }

    fn kind(kind: &str) -> KindLabels {
        KindLabels {
            kind: kind.to_string(),
        }
    }

    pub fn record_reconcile(&self, kind: &str, result: &str, seconds: f64) {
        self.reconcile_total
            .get_or_create(&ResultLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration
            .get_or_create(&Self::kind(kind))
            .observe(seconds);
    }

    pub fn record_error(&self, kind: &str, error: &Error) {
        self.reconcile_errors
            .get_or_create(&ErrorLabels {
                kind: kind.to_string(),
                class: error.class().to_string(),
            })
            .inc();
    }

    pub fn record_persistent_failure(&self, kind: &str) {
        self.persistent_failures.get_or_create(&Self::kind(kind)).inc();
    }

    pub fn record_queue_add(&self, kind: &str) {
        self.queue_adds.get_or_create(&Self::kind(kind)).inc();
    }

    pub fn record_queue_retry(&self, kind: &str) {
        self.queue_retries.get_or_create(&Self::kind(kind)).inc();
    }

    pub fn record_watch_restart(&self, kind: &str) {
        self.watch_restarts.get_or_create(&Self::kind(kind)).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn set_leader(&self, leading: bool) {
        self.leader_active.set(i64::from(leading));
    }

    /// Encode every registered metric in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buf = String::new();
        let registry = self.registry.lock();
        prometheus_client::encoding::text::encode(&mut buf, &registry)
            .map_err(|e| Error::Other(format!("failed to encode metrics: {e}")))?;
        Ok(buf)
    }
}
