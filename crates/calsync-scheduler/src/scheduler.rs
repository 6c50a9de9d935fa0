use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodic sync trigger with a re-entrancy guard (spec.md §4.9). Owns one
/// `isSyncing` flag per instance — no global mutable state (DESIGN NOTES).
/// Manual triggers (`sync-now`) and the periodic tick share the same guard.
#[derive(Clone)]
pub struct Scheduler {
    is_syncing: Arc<AtomicBool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            is_syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Spawns the periodic ticker. Every tick that lands while a run is
    /// already in progress is dropped silently; `interval_minutes` is
    /// floored at 1 per spec.md §4.9.
    pub fn spawn_periodic<F, Fut>(&self, interval_minutes: u32, mut run: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let guard = self.is_syncing.clone();
        let period = Duration::from_secs(interval_minutes.max(1) as u64 * 60);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately; consume it
            loop {
                ticker.tick().await;
                if guard.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                    tracing::debug!("scheduler: dropping tick, a sync is already in progress");
                    continue;
                }
                run().await;
                guard.store(false, Ordering::SeqCst);
            }
        })
    }

    /// Manual trigger (`sync-now`, spec.md §6). Returns `false` without
    /// running `run` if a sync is already in progress; `true` once `run`
    /// has completed.
    pub async fn trigger_now<F, Fut>(&self, run: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        run().await;
        self.is_syncing.store(false, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn trigger_now_runs_when_idle() {
        let scheduler = Scheduler::new();
        let ran = scheduler.trigger_now(|| async { }).await;
        assert!(ran);
        assert!(!scheduler.is_syncing());
    }

    #[tokio::test]
    async fn second_trigger_is_dropped_while_first_is_in_flight() {
        let scheduler = Scheduler::new();
        scheduler.is_syncing.store(true, Ordering::SeqCst);
        let ran = scheduler.trigger_now(|| async { }).await;
        assert!(!ran);
    }

    #[tokio::test]
    async fn periodic_tick_skips_runs_while_guard_is_held() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        scheduler.is_syncing.store(true, Ordering::SeqCst);

        let handle = scheduler.spawn_periodic(1, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
