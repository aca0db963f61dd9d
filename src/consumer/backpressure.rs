//! Downstream pending-depth gate with hysteresis.
//!
//! Depth counts records being persisted plus notifications waiting for (or
//! undergoing) delivery. Consumption pauses once depth exceeds `max_pending`
//! and resumes when it drains to half that bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::metrics::ConsumerMetrics;

/// Re-check interval while paused, in case a wake-up raced with a resume.
const PAUSE_RECHECK: Duration = Duration::from_millis(100);

pub struct BackpressureGate {
    depth: AtomicUsize,
    max_pending: usize,
    resume_at: usize,
    paused: watch::Sender<bool>,
}

impl BackpressureGate {
    pub fn new(max_pending: usize) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            depth: AtomicUsize::new(0),
            max_pending,
            resume_at: max_pending / 2,
            paused,
        })
    }

    /// Count one unit of pending work until the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> DepthGuard {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        ConsumerMetrics::set_pending_depth(depth);

        if depth > self.max_pending {
            let paused = self.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
            if paused {
                ConsumerMetrics::record_pause();
                tracing::info!(depth = depth, max_pending = self.max_pending, "Backpressure: pausing consumption");
            }
        }

        DepthGuard { gate: self.clone() }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Return once consumption may continue.
    pub async fn wait_for_capacity(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if self.depth() <= self.resume_at {
                self.resume(self.depth());
                return;
            }
            let _ = tokio::time::timeout(PAUSE_RECHECK, rx.changed()).await;
        }
    }

    fn release(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        ConsumerMetrics::set_pending_depth(depth);
        if depth <= self.resume_at {
            self.resume(depth);
        }
    }

    fn resume(&self, depth: usize) {
        let resumed = self.paused.send_if_modified(|paused| std::mem::replace(paused, false));
        if resumed {
            tracing::info!(depth = depth, "Backpressure: resuming consumption");
        }
    }
}

/// RAII unit of pending depth.
pub struct DepthGuard {
    gate: Arc<BackpressureGate>,
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for DepthGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthGuard")
            .field("depth", &self.gate.depth())
            .finish()
    }
}
