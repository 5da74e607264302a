//! Progress counters for a running batch.

use crate::task::ExecutionResult;

use log::info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Point-in-time view of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub success: usize,
    pub fail: usize,
    pub running: usize,
    pub queued: usize,
    /// `success / completed`, 0.0 before anything completes.
    pub success_rate: f64,
}

/// Lock-free tally of batch progress.
///
/// Counters are independent atomics, so a snapshot taken while the executor
/// is recording a result may be one result behind (e.g. `running` already
/// decremented but `completed` not yet incremented). Readers never block the
/// executor.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: AtomicUsize,
    completed: AtomicUsize,
    success: AtomicUsize,
    fail: AtomicUsize,
    running: AtomicUsize,
    queued: AtomicUsize,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter and expect `total` tasks.
    pub fn begin(&self, total: usize) {
        self.reset();
        self.total.store(total, Ordering::Relaxed);
        self.queued.store(total, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.total,
            &self.completed,
            &self.success,
            &self.fail,
            &self.running,
            &self.queued,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Count a terminal result.
    pub fn on_result(&self, result: &ExecutionResult) {
        if result.success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fail.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: usize) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn set_queued(&self, queued: usize) {
        self.queued.store(queued, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed,
            success,
            fail: self.fail.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            success_rate: if completed == 0 {
                0.0
            } else {
                success as f64 / completed as f64
            },
        }
    }

    /// Log a progress line every `every` until the handle is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let s = tracker.snapshot();
                let pct = if s.total == 0 {
                    100.0
                } else {
                    s.completed as f64 * 100.0 / s.total as f64
                };
                info!(
                    "Progress: {}/{} ({:.1}%) - {} succeeded, {} failed, {} running, {} queued",
                    s.completed, s.total, pct, s.success, s.fail, s.running, s.queued
                );
            }
        })
    }
}
