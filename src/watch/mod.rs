//! Watch multiplexer: one change-stream subscription per registered kind,
//! funnelled through a channel into the object cache and the work queue.
//!
//! Subscriptions are producers only. A single dispatcher consumes the channel,
//! so cache writes and queue insertions never happen from inside a store
//! callback. Every `resync_period` the dispatcher re-enqueues every cached
//! identity, which heals events lost across reconnects.

pub mod cache;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ObjectSnapshot, WatchEvent, WatchEventType};
use crate::queue::WorkQueue;
use crate::store::StateStore;
use crate::telemetry::metrics::ControllerMetrics;

pub use cache::ObjectCache;

/// Configuration for the watch multiplexer.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// How often every known identity is re-enqueued.
    pub resync_period: Duration,
    /// First delay before re-subscribing after a broken stream.
    pub initial_backoff: Duration,
    /// Ceiling for the re-subscribe delay.
    pub max_backoff: Duration,
    /// Capacity of the subscription → dispatcher channel.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(600),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            channel_capacity: 1024,
        }
    }
}

/// Messages from subscriptions to the dispatcher.
#[derive(Debug)]
enum Notification {
    /// Full listing of a kind (initial sync or re-list after reconnect).
    Listed {
        kind: String,
        snapshots: Vec<ObjectSnapshot>,
    },
    Event(WatchEvent),
}

/// How a subscription's stream ended.
enum StreamEnd {
    Cancelled,
    Closed,
}

pub struct WatchMultiplexer {
    store: Arc<dyn StateStore>,
    queue: Arc<WorkQueue>,
    cache: Arc<ObjectCache>,
    kinds: Vec<String>,
    config: WatchConfig,
    metrics: Option<Arc<ControllerMetrics>>,
    listed: Mutex<HashSet<String>>,
    synced: watch::Sender<bool>,
}

impl WatchMultiplexer {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<WorkQueue>,
        cache: Arc<ObjectCache>,
        kinds: Vec<String>,
        config: WatchConfig,
    ) -> Self {
        let (synced, _) = watch::channel(kinds.is_empty());
        Self {
            store,
            queue,
            cache,
            kinds,
            config,
            metrics: None,
            listed: Mutex::new(HashSet::new()),
            synced,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// True once every kind has completed its initial listing.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Follow sync state changes.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Run every subscription plus the dispatcher until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut subscriptions = JoinSet::new();
        for kind in &self.kinds {
            let subscription = Subscription {
                kind: kind.clone(),
                store: Arc::clone(&self.store),
                tx: tx.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
            };
            subscriptions.spawn(subscription.run(cancel.clone()));
        }
        drop(tx);

        info!(kinds = ?self.kinds, "watches started");
        self.dispatch(rx, &cancel).await;

        subscriptions.shutdown().await;
        self.synced.send_replace(false);
        info!("watches stopped");
    }

    async fn dispatch(&self, mut rx: mpsc::Receiver<Notification>, cancel: &CancellationToken) {
        let period = self.config.resync_period.max(Duration::from_secs(1));
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = resync.tick() => self.resync(),
                notification = rx.recv() => match notification {
                    Some(n) => self.apply(n),
                    None => return,
                },
            }
        }
    }

    fn apply(&self, notification: Notification) {
        match notification {
            Notification::Listed { kind, snapshots } => {
                let ids: Vec<_> = snapshots.iter().map(|s| s.id.clone()).collect();
                self.cache.replace_kind(&kind, snapshots);
                debug!(kind = %kind, count = ids.len(), "listed");
                for id in ids {
                    self.queue.add(id);
                }
                self.mark_listed(kind);
            }
            Notification::Event(event) => {
                let id = event.snapshot.id.clone();
                debug!(object = %id, event = %event.event_type, "watch event");
                match event.event_type {
                    WatchEventType::Added | WatchEventType::Modified => {
                        self.cache.upsert(event.snapshot);
                    }
                    WatchEventType::Deleted => {
                        self.cache.remove(&id);
                    }
                }
                self.queue.add(id);
            }
        }
    }

    fn mark_listed(&self, kind: String) {
        let all_listed = {
            let mut listed = self.listed.lock();
            listed.insert(kind);
            self.kinds.iter().all(|k| listed.contains(k))
        };
        if all_listed && !self.has_synced() {
            info!("all watches synced");
            self.synced.send_replace(true);
        }
    }

    /// Re-enqueue every cached identity of every kind.
    pub fn resync(&self) {
        let mut total = 0usize;
        for kind in &self.kinds {
            for id in self.cache.ids_of(kind) {
                self.queue.add(id);
                total += 1;
            }
        }
        debug!(count = total, "periodic resync");
    }
}

struct Subscription {
    kind: String,
    store: Arc<dyn StateStore>,
    tx: mpsc::Sender<Notification>,
    config: WatchConfig,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl Subscription {
    async fn run(self, cancel: CancellationToken) {
        let mut backoff = self.config.initial_backoff;
        loop {
            let started = Instant::now();
            match self.stream_once(&cancel).await {
                Ok(StreamEnd::Cancelled) => return,
                Ok(StreamEnd::Closed) => {
                    warn!(kind = %self.kind, "watch stream closed, re-subscribing");
                }
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "watch failed, re-subscribing");
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_watch_restart(&self.kind);
            }

            if started.elapsed() >= self.config.max_backoff {
                backoff = self.config.initial_backoff;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Subscribe, list, then forward events until the stream breaks.
    ///
    /// The watch is opened before listing so nothing written in between is
    /// missed; replays of already-listed versions are ignored by the cache.
    async fn stream_once(&self, cancel: &CancellationToken) -> Result<StreamEnd> {
        let mut stream = self.store.watch(&self.kind).await?;
        let snapshots = self.store.list(&self.kind).await?;

        let listed = Notification::Listed {
            kind: self.kind.clone(),
            snapshots,
        };
        if self.tx.send(listed).await.is_err() {
            return Ok(StreamEnd::Cancelled);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if self.tx.send(Notification::Event(event)).await.is_err() {
                            return Ok(StreamEnd::Cancelled);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(StreamEnd::Closed),
                },
            }
        }
    }
}
