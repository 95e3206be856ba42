//! Liveness and readiness flags served by the probe endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Process health as seen by the orchestrator.
///
/// Both flags start healthy. With a heartbeat configured, liveness also
/// requires a [`beat`](Self::beat) within `stale_after`.
pub struct HealthSignal {
    live: AtomicBool,
    ready: AtomicBool,
    stale_after: Option<Duration>,
    last_beat: Mutex<Instant>,
}

impl Default for HealthSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSignal {
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            stale_after: None,
            last_beat: Mutex::new(Instant::now()),
        }
    }

    pub fn with_heartbeat(stale_after: Duration) -> Self {
        Self {
            stale_after: Some(stale_after),
            ..Self::new()
        }
    }

    pub fn is_live(&self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        match self.stale_after {
            Some(limit) => self.last_beat.lock().elapsed() <= limit,
            None => true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }
}
