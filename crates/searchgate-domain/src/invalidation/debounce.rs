//! Single-flight debounced trigger.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Collapses bursts of triggers into one action per quiet period.
///
/// `arm` starts a timer unless one is already pending. When the timer fires
/// the pending flag is cleared and then the action runs, so a trigger that
/// arrives while the action is running arms the next cycle.
pub struct DebouncedTrigger {
    quiet_period: Duration,
    pending: Arc<AtomicBool>,
    fired: Arc<AtomicU64>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedTrigger {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            pending: Arc::new(AtomicBool::new(false)),
            fired: Arc::new(AtomicU64::new(0)),
            timer: Mutex::new(None),
        }
    }

    /// Schedules `action` after the quiet period. Returns false if a run was
    /// already pending, in which case `action` is dropped.
    pub fn arm<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let pending = self.pending.clone();
        let fired = self.fired.clone();
        let quiet_period = self.quiet_period;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            pending.store(false, Ordering::Release);
            fired.fetch_add(1, Ordering::Relaxed);
            action().await;
        });

        let mut timer = self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *timer = Some(handle);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Cancels a pending run, if any.
    pub fn reset(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = timer.take() {
            if !handle.is_finished() {
                handle.abort();
                self.pending.store(false, Ordering::Release);
            }
        }
    }

    /// Number of times the timer has fired.
    pub fn fire_count(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }
}

impl Drop for DebouncedTrigger {
    fn drop(&mut self) {
        self.reset();
    }
}
