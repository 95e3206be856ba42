//! Integration tests for the reconcile engine against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use addon_controller::controllers::{NAMESPACE_KIND, NODE_KIND, NamespaceReconciler, NodeReconciler};
use addon_controller::engine::{
    EngineConfig, ReconcileContext, ReconcileEngine, Reconciler, ReconcilerRegistry,
};
use addon_controller::error::Error;
use addon_controller::model::{
    ObjectIdentity, ObjectSnapshot, ReconcileResult, Taint, TaintEffect,
};
use addon_controller::queue::{ExponentialFailureLimiter, WorkQueue};
use addon_controller::store::InMemoryStore;
use addon_controller::telemetry::metrics::ControllerMetrics;
use addon_controller::watch::ObjectCache;

struct Harness {
    store: Arc<InMemoryStore>,
    queue: Arc<WorkQueue>,
    cache: Arc<ObjectCache>,
    engine: ReconcileEngine,
    metrics: Arc<ControllerMetrics>,
}

fn harness(reconcilers: Vec<Arc<dyn Reconciler>>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let metrics = Arc::new(ControllerMetrics::new());
    let queue = Arc::new(
        WorkQueue::new(Box::new(ExponentialFailureLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        )))
        .with_metrics(metrics.clone()),
    );
    let cache = Arc::new(ObjectCache::new());

    let mut registry = ReconcilerRegistry::new();
    for reconciler in reconcilers {
        registry.register(reconciler).unwrap();
    }
    let ctx = ReconcileContext::new(store.clone(), cache.clone());
    let engine = ReconcileEngine::new(
        queue.clone(),
        Arc::new(registry),
        ctx,
        EngineConfig::default(),
    )
    .with_metrics(metrics.clone());

    Harness {
        store,
        queue,
        cache,
        engine,
        metrics,
    }
}

/// Take the next identity off the queue and reconcile it.
async fn step(h: &Harness) -> ObjectIdentity {
    let id = tokio::time::timeout(Duration::from_secs(5), h.queue.get())
        .await
        .unwrap()
        .unwrap();
    h.engine.process(id.clone()).await;
    id
}

fn namespace_reconciler() -> Arc<dyn Reconciler> {
    Arc::new(NamespaceReconciler::new("owner", "platform"))
}

fn node_reconciler() -> Arc<dyn Reconciler> {
    Arc::new(NodeReconciler::new(
        "gpu",
        "true",
        Taint::new("nvidia.com/gpu", "true", TaintEffect::NoSchedule),
    ))
}

/// Reconciler whose result is computed from the call number.
struct FnReconciler<F> {
    kind: &'static str,
    calls: AtomicU32,
    f: F,
}

impl<F> FnReconciler<F>
where
    F: Fn(u32) -> ReconcileResult + Send + Sync + 'static,
{
    fn new(kind: &'static str, f: F) -> Arc<Self> {
        Arc::new(Self {
            kind,
            calls: AtomicU32::new(0),
            f,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Reconciler for FnReconciler<F>
where
    F: Fn(u32) -> ReconcileResult + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        self.kind
    }

    async fn reconcile(&self, _snapshot: ObjectSnapshot, _ctx: &ReconcileContext) -> ReconcileResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(call)
    }
}

// ---------------------------------------------------------------------------
// Domain reconcilers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn namespace_without_owner_label_is_labeled() {
    let h = harness(vec![namespace_reconciler()]);
    let id = ObjectIdentity::cluster(NAMESPACE_KIND, "team-a");
    let created = h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;

    let stored = h.store.snapshot(&id).unwrap();
    assert_eq!(stored.label_value("owner"), Some("platform"));
    assert!(stored.resource_version > created.resource_version);
    assert!(h.queue.is_empty());
    assert_eq!(h.queue.delayed_len(), 0);

    // A second pass is a no-op.
    h.queue.add(id.clone());
    step(&h).await;
    assert_eq!(
        h.store.snapshot(&id).unwrap().resource_version,
        stored.resource_version
    );
}

#[tokio::test]
async fn gpu_node_gets_exactly_one_taint() {
    let h = harness(vec![node_reconciler()]);
    let id = ObjectIdentity::cluster(NODE_KIND, "gpu-1");
    h.store
        .create(ObjectSnapshot::new(id.clone()).label("gpu", "true"))
        .unwrap();

    h.queue.add(id.clone());
    step(&h).await;
    h.queue.add(id.clone());
    step(&h).await;

    let stored = h.store.snapshot(&id).unwrap();
    assert_eq!(
        stored.spec,
        json!({"taints": [{"key": "nvidia.com/gpu", "value": "true", "effect": "NoSchedule"}]})
    );
}

#[tokio::test]
async fn cpu_node_is_not_tainted() {
    let h = harness(vec![node_reconciler()]);
    let id = ObjectIdentity::cluster(NODE_KIND, "cpu-1");
    let created = h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;

    assert_eq!(h.store.snapshot(&id).unwrap(), created);
}

// ---------------------------------------------------------------------------
// Result handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflict_refetches_and_then_succeeds() {
    let h = harness(vec![namespace_reconciler()]);
    let id = ObjectIdentity::cluster(NAMESPACE_KIND, "team-a");
    let stale = h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    // The cache still holds the first version when someone else writes.
    h.cache.upsert(stale);
    h.store
        .apply(ObjectSnapshot::new(id.clone()).label("tier", "gold"));

    h.queue.add(id.clone());
    step(&h).await;
    assert_eq!(h.queue.num_requeues(&id), 1);
    assert!(h.cache.get(&id).is_none(), "stale entry must be evicted");

    // The retry reads the fresh object and wins.
    step(&h).await;
    let stored = h.store.snapshot(&id).unwrap();
    assert_eq!(stored.label_value("owner"), Some("platform"));
    assert_eq!(stored.label_value("tier"), Some("gold"));
    assert_eq!(h.queue.num_requeues(&id), 0);
}

#[tokio::test]
async fn deleted_object_is_dropped_without_error() {
    let reconciler = FnReconciler::new("Widget", |_| ReconcileResult::Done);
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "gone");

    h.queue.add(id.clone());
    step(&h).await;

    assert_eq!(reconciler.calls(), 0);
    assert!(h.queue.is_empty());
    assert_eq!(h.queue.delayed_len(), 0);
    assert_eq!(h.queue.num_requeues(&id), 0);
}

#[tokio::test]
async fn unknown_kind_is_dropped() {
    let h = harness(vec![namespace_reconciler()]);
    let id = ObjectIdentity::new("Gadget", "default", "g1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;

    assert!(h.queue.is_empty());
    assert_eq!(h.queue.delayed_len(), 0);
}

#[tokio::test]
async fn requeue_after_schedules_a_delayed_retry() {
    let reconciler =
        FnReconciler::new("Widget", |_| ReconcileResult::RequeueAfter(Duration::from_secs(3600)));
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "w1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;

    assert!(h.queue.is_empty());
    assert_eq!(h.queue.delayed_len(), 1);
    assert_eq!(h.queue.num_requeues(&id), 0);
}

#[tokio::test]
async fn requeue_immediate_comes_straight_back() {
    let reconciler = FnReconciler::new("Widget", |call| {
        if call == 0 {
            ReconcileResult::RequeueImmediate
        } else {
            ReconcileResult::Done
        }
    });
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "w1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;
    assert_eq!(h.queue.len(), 1);
    step(&h).await;
    assert_eq!(reconciler.calls(), 2);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn panicking_reconciler_is_retried() {
    let reconciler = FnReconciler::new("Widget", |call| {
        if call == 0 {
            panic!("reconciler bug");
        }
        ReconcileResult::Done
    });
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "w1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;
    assert_eq!(h.queue.num_requeues(&id), 1);

    step(&h).await;
    assert_eq!(reconciler.calls(), 2);
    assert_eq!(h.queue.num_requeues(&id), 0);
}

#[tokio::test]
async fn permanent_errors_are_reported_and_keep_backing_off() {
    let reconciler = FnReconciler::new("Widget", |_| {
        ReconcileResult::Error(Error::Permanent("bad spec".into()))
    });
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "w1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;
    step(&h).await;

    assert_eq!(h.queue.num_requeues(&id), 2);
    assert_eq!(h.queue.delayed_len(), 1);

    let text = h.metrics.encode().unwrap();
    assert!(text.contains("addon_controller_persistent_failures_total{kind=\"Widget\"} 2"));
    assert!(text.contains(
        "addon_controller_reconcile_errors_total{kind=\"Widget\",class=\"permanent\"} 2"
    ));
}

#[tokio::test]
async fn failures_past_the_alert_threshold_are_persistent() {
    let reconciler = FnReconciler::new("Widget", |_| {
        ReconcileResult::Error(Error::Transient("store unavailable".into()))
    });
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "w1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    for _ in 0..16 {
        step(&h).await;
    }

    let text = h.metrics.encode().unwrap();
    assert!(text.contains("addon_controller_persistent_failures_total{kind=\"Widget\"} 1"));
}

#[tokio::test]
async fn unexpected_errors_still_back_off() {
    let reconciler = FnReconciler::new("Widget", |call| {
        if call == 0 {
            ReconcileResult::Error(Error::Other("unexpected payload".into()))
        } else {
            ReconcileResult::Done
        }
    });
    let h = harness(vec![reconciler.clone()]);
    let id = ObjectIdentity::new("Widget", "default", "w1");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();

    h.queue.add(id.clone());
    step(&h).await;
    assert_eq!(h.queue.num_requeues(&id), 1);
    let text = h.metrics.encode().unwrap();
    assert!(text.contains("addon_controller_reconcile_errors_total{kind=\"Widget\",class=\"other\"} 1"));
    assert!(!text.contains("addon_controller_persistent_failures_total{"));

    step(&h).await;
    assert_eq!(reconciler.calls(), 2);
    assert_eq!(h.queue.num_requeues(&id), 0);
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_reconciles_everything_then_stops() {
    let h = harness(vec![namespace_reconciler()]);
    let ids: Vec<ObjectIdentity> = (0..40)
        .map(|i| ObjectIdentity::cluster(NAMESPACE_KIND, format!("team-{i}")))
        .collect();
    for id in &ids {
        h.store.create(ObjectSnapshot::new(id.clone())).unwrap();
        h.queue.add(id.clone());
    }

    let engine = h.engine.clone();
    let running = tokio::spawn(async move { engine.run(CancellationToken::new()).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let all_labeled = ids.iter().all(|id| {
                h.store.snapshot(id).unwrap().label_value("owner") == Some("platform")
            });
            if all_labeled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(h.queue.shut_down_with_drain(Duration::from_secs(5)).await);
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.engine.active(), 0);
}

/// Labels the object after a pause, through the reconcile context.
struct SlowLabeler {
    started: AtomicU32,
    pause: Duration,
}

#[async_trait]
impl Reconciler for SlowLabeler {
    fn kind(&self) -> &str {
        NAMESPACE_KIND
    }

    async fn reconcile(&self, snapshot: ObjectSnapshot, ctx: &ReconcileContext) -> ReconcileResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pause).await;
        let labeled = snapshot.label("owner", "late");
        ctx.update(&labeled).await.map(|_| ReconcileResult::Done).into()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn halt_aborts_in_flight_reconciles_before_they_write() {
    let slow = Arc::new(SlowLabeler {
        started: AtomicU32::new(0),
        pause: Duration::from_millis(400),
    });
    let reconciler: Arc<dyn Reconciler> = slow.clone();
    let h = harness(vec![reconciler]);
    let id = ObjectIdentity::cluster(NAMESPACE_KIND, "team-a");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();
    h.queue.add(id.clone());

    let halt = CancellationToken::new();
    let engine = h.engine.clone();
    let running = {
        let halt = halt.clone();
        tokio::spawn(async move { engine.run(halt).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while slow.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.engine.active(), 1);

    h.queue.shut_down();
    halt.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.engine.active(), 0);

    // Well past the pause: the aborted reconcile never reached the store.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.store.snapshot(&id).unwrap().label_value("owner"), None);
}

#[tokio::test]
async fn cache_miss_reads_do_not_fill_the_cache() {
    let h = harness(vec![namespace_reconciler()]);
    let id = ObjectIdentity::cluster(NAMESPACE_KIND, "team-a");
    h.store.create(ObjectSnapshot::new(id.clone())).unwrap();
    let ctx = ReconcileContext::new(h.store.clone(), h.cache.clone());

    let read = ctx.get(&id).await.unwrap();
    assert_eq!(read.id, id);
    // The watch owns cache membership; a read racing a delete must not
    // bring the object back.
    assert!(h.cache.get(&id).is_none());

    h.store.delete(&id).unwrap();
    assert!(ctx.get(&id).await.unwrap_err().is_not_found());
}
