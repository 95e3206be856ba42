//! Reconcile engine: a pool of workers draining the work queue.
//!
//! Each worker takes one identity at a time, fetches its latest snapshot,
//! routes it to the kind's reconciler and turns the result into a queue
//! action. A reconciler panic is caught on the worker and becomes an ordinary
//! error. Reconciles run on the worker task itself, so aborting the workers
//! stops every write in flight.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::Error;
use crate::model::{ObjectIdentity, ReconcileResult};
use crate::queue::WorkQueue;
use crate::telemetry::metrics::ControllerMetrics;
use crate::telemetry::reconcile::{record_outcome, start_reconcile_span};

use super::registry::{ReconcileContext, ReconcilerRegistry};

/// Configuration for the reconcile engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Consecutive failures after which an identity is reported as a
    /// persistent failure.
    pub retry_alert_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_alert_threshold: 15,
        }
    }
}

/// Worker pool over one [`WorkQueue`].
#[derive(Clone)]
pub struct ReconcileEngine {
    queue: Arc<WorkQueue>,
    registry: Arc<ReconcilerRegistry>,
    ctx: ReconcileContext,
    config: EngineConfig,
    metrics: Option<Arc<ControllerMetrics>>,
    active: Arc<AtomicUsize>,
}

impl ReconcileEngine {
    pub fn new(
        queue: Arc<WorkQueue>,
        registry: Arc<ReconcilerRegistry>,
        ctx: ReconcileContext,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            ctx,
            config,
            metrics: None,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Reconciles currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run the workers until the queue shuts down, or until `halt` fires.
    ///
    /// On `halt` the workers are aborted mid-reconcile. Either way this
    /// returns only once every worker task has finished.
    pub async fn run(&self, halt: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(workers, "reconcile engine started");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let engine = self.clone();
            set.spawn(async move { engine.worker_loop(worker).await });
        }

        let mut halted = false;
        loop {
            tokio::select! {
                _ = halt.cancelled(), if !halted => {
                    warn!(in_flight = self.active(), "aborting workers");
                    set.abort_all();
                    halted = true;
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if !e.is_cancelled() => error!(error = %e, "worker task failed"),
                    Some(_) => {}
                },
            }
        }
        info!("reconcile engine stopped");
    }

    async fn worker_loop(&self, worker: usize) {
        while let Some(id) = self.queue.get().await {
            self.process(id).await;
        }
        debug!(worker, "worker exiting");
    }

    /// Reconcile one identity and settle it in the queue.
    pub async fn process(&self, id: ObjectIdentity) {
        let span = start_reconcile_span(&id);
        async {
            let snapshot = match self.ctx.get(&id).await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_not_found() => {
                    debug!(object = %id, "object no longer exists, dropping");
                    self.queue.done(&id);
                    self.queue.forget(&id);
                    return;
                }
                Err(e) => {
                    self.handle_error(&id, e);
                    return;
                }
            };

            let Some(reconciler) = self.registry.get(&id.kind).cloned() else {
                warn!(object = %id, "no reconciler registered for kind, dropping");
                self.queue.done(&id);
                self.queue.forget(&id);
                return;
            };

            let result = {
                let _in_flight = InFlight::enter(&self.active);
                let started = Instant::now();
                let result = AssertUnwindSafe(reconciler.reconcile(snapshot, &self.ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        ReconcileResult::Error(Error::Other(format!(
                            "reconciler panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                if let Some(metrics) = &self.metrics {
                    metrics.record_reconcile(&id.kind, result.label(), started.elapsed().as_secs_f64());
                }
                result
            };

            let attempt = self.queue.num_requeues(&id).saturating_add(1);
            record_outcome(&span, result.label(), attempt);

            match result {
                ReconcileResult::Done => {
                    self.queue.done(&id);
                    self.queue.forget(&id);
                }
                ReconcileResult::RequeueAfter(delay) => {
                    self.queue.done(&id);
                    self.queue.forget(&id);
                    self.queue.add_after(id, delay);
                }
                ReconcileResult::RequeueImmediate => {
                    self.queue.done(&id);
                    self.queue.add(id);
                }
                ReconcileResult::Error(e) => self.handle_error(&id, e),
            }
        }
        .instrument(span.clone())
        .await
    }

    fn handle_error(&self, id: &ObjectIdentity, e: Error) {
        self.queue.done(id);
        let failures = self.queue.num_requeues(id).saturating_add(1);
        self.queue.add_rate_limited(id.clone());

        if let Some(metrics) = &self.metrics {
            metrics.record_error(&id.kind, &e);
        }

        if e.is_permanent() || failures > self.config.retry_alert_threshold {
            error!(object = %id, failures, error = %e, "persistent reconcile failure");
            if let Some(metrics) = &self.metrics {
                metrics.record_persistent_failure(&id.kind);
            }
        } else if e.is_conflict() {
            debug!(object = %id, failures, error = %e, "conflict, retrying with fresh state");
        } else if e.is_retryable() {
            warn!(object = %id, failures, error = %e, "reconcile failed, retrying");
        } else {
            error!(object = %id, failures, class = e.class(), error = %e, "unexpected reconcile error, retrying");
        }
    }
}

/// Counts a reconcile as in flight until dropped, including by an abort.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
