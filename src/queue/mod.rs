//! Deduplicating, delay-aware, rate-limited work queue of object identities.
//!
//! An identity is at most once "pending or in flight": adding an identity
//! that is already queued is a no-op, and adding one that a worker is
//! processing marks it dirty so it is queued again exactly once when the
//! worker calls [`WorkQueue::done`]. No identity is ever handed to two
//! workers at the same time.
//!
//! State sits behind one mutex; blocked [`WorkQueue::get`] callers park on a
//! [`Notify`] and, when only delayed items exist, on a timer for the earliest
//! ready time.

pub mod limiter;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::model::ObjectIdentity;
use crate::telemetry::metrics::ControllerMetrics;

pub use limiter::{
    BucketLimiter, ExponentialFailureLimiter, MaxOfLimiter, RateLimiter,
    default_controller_limiter,
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Delayed {
    ready_at: Instant,
    seq: u64,
    id: ObjectIdentity,
}

#[derive(Default)]
struct State {
    /// Ready identities in delivery order.
    queue: VecDeque<ObjectIdentity>,
    /// Identities that need processing (queued, or re-added mid-processing).
    dirty: HashSet<ObjectIdentity>,
    /// Identities currently held by a worker.
    processing: HashSet<ObjectIdentity>,
    /// Delayed insertions, earliest first. May hold stale entries.
    waiting: BinaryHeap<Reverse<Delayed>>,
    /// Authoritative ready time per delayed identity.
    ready_at: HashMap<ObjectIdentity, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl State {
    /// Returns true if `id` was appended to the ready queue.
    fn insert(&mut self, id: ObjectIdentity) -> bool {
        if self.shutting_down || self.dirty.contains(&id) {
            return false;
        }
        self.dirty.insert(id.clone());
        if self.processing.contains(&id) {
            return false;
        }
        self.queue.push_back(id);
        true
    }

    /// Move every delayed identity whose time has come into the ready queue.
    fn promote_ready(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse(top)) = self.waiting.peek() {
            if top.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.waiting.pop() else {
                break;
            };
            if self.ready_at.get(&entry.id) != Some(&entry.ready_at) {
                continue;
            }
            self.ready_at.remove(&entry.id);
            if self.insert(entry.id) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse(d)| d.ready_at)
    }
}

pub struct WorkQueue {
    state: Mutex<State>,
    /// Signalled when an item becomes ready, a delay changes, or on shutdown.
    ready: Notify,
    /// Signalled when the processing set becomes empty.
    idle: Notify,
    limiter: Box<dyn RateLimiter>,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl WorkQueue {
    pub fn new(limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            idle: Notify::new(),
            limiter,
            metrics: None,
        }
    }

    /// Queue with the controller's default limiter (5 ms → 1000 s backoff).
    pub fn with_default_limiter() -> Self {
        Self::new(Box::new(default_controller_limiter(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )))
    }

    pub fn with_metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn observe_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth);
        }
    }

    /// Queue `id` unless it is already pending. If a worker holds it, it is
    /// queued again once that worker calls [`done`](Self::done).
    pub fn add(&self, id: ObjectIdentity) {
        if let Some(metrics) = &self.metrics {
            metrics.record_queue_add(&id.kind);
        }
        let (pushed, depth) = {
            let mut state = self.state.lock();
            let pushed = state.insert(id);
            (pushed, state.queue.len())
        };
        if pushed {
            self.observe_depth(depth);
            self.ready.notify_one();
        }
    }

    /// Queue `id` after `delay`. Repeated calls keep the earliest time.
    pub fn add_after(&self, id: ObjectIdentity, delay: Duration) {
        if delay.is_zero() {
            self.add(id);
            return;
        }
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let ready_at = Instant::now() + delay;
            if let Some(existing) = state.ready_at.get(&id) {
                if *existing <= ready_at {
                    return;
                }
            }
            state.seq = state.seq.wrapping_add(1);
            let seq = state.seq;
            state.ready_at.insert(id.clone(), ready_at);
            state.waiting.push(Reverse(Delayed { ready_at, seq, id }));
        }
        // A sleeping getter may need to shorten its timer.
        self.ready.notify_one();
    }

    /// Queue `id` after the limiter's backoff and count one more failure.
    pub fn add_rate_limited(&self, id: ObjectIdentity) {
        let delay = self.limiter.when(&id);
        if let Some(metrics) = &self.metrics {
            metrics.record_queue_retry(&id.kind);
        }
        debug!(object = %id, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(id, delay);
    }

    /// Reset the failure count of `id`.
    pub fn forget(&self, id: &ObjectIdentity) {
        self.limiter.forget(id);
    }

    /// Failures recorded for `id` since the last `forget`.
    pub fn num_requeues(&self, id: &ObjectIdentity) -> u32 {
        self.limiter.retries(id)
    }

    /// Wait for the next ready identity and mark it as processing. Returns
    /// `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<ObjectIdentity> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready_at = {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_ready(Instant::now());
                if let Some(id) = state.queue.pop_front() {
                    state.dirty.remove(&id);
                    state.processing.insert(id.clone());
                    let remaining = state.queue.len();
                    drop(state);

                    self.observe_depth(remaining);
                    if remaining > 0 {
                        // Pass the baton so items promoted by this call are
                        // not left waiting for the next add.
                        self.ready.notify_one();
                    }
                    return Some(id);
                }
                state.next_ready_at()
            };

            match next_ready_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `id` after processing. Queues it again if it was added while
    /// being processed.
    pub fn done(&self, id: &ObjectIdentity) {
        let (requeued, idle, depth) = {
            let mut state = self.state.lock();
            state.processing.remove(id);
            let requeued = !state.shutting_down && state.dirty.contains(id);
            if requeued {
                state.queue.push_back(id.clone());
            }
            (requeued, state.processing.is_empty(), state.queue.len())
        };
        if requeued {
            self.observe_depth(depth);
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Identities ready for delivery.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities scheduled for later delivery.
    pub fn delayed_len(&self) -> usize {
        self.state.lock().ready_at.len()
    }

    /// Identities currently held by workers.
    pub fn processing_len(&self) -> usize {
        self.state.lock().processing.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Stop handing out work. Blocked and future `get` calls return `None`;
    /// new additions are ignored. Identities in flight may still call `done`.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.ready.notify_waiters();
    }

    /// [`shut_down`](Self::shut_down), then wait up to `grace` for in-flight
    /// identities to be released. Returns false if the grace period ran out.
    pub async fn shut_down_with_drain(&self, grace: Duration) -> bool {
        self.shut_down();
        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.state.lock().processing.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}
