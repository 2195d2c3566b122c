//! Periodic expiry sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::protection::DdosProtection;

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    running: Arc<AtomicBool>,
    sweeps: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Whether the task is still sweeping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Sweeps completed so far.
    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Stop sweeping.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a task that sweeps `protection` every `interval`.
///
/// Must be called from within a tokio runtime. The first sweep runs one
/// interval after spawning.
pub fn spawn_sweeper(protection: Arc<DdosProtection>, interval: Duration) -> SweeperHandle {
    let running = Arc::new(AtomicBool::new(true));
    let sweeps = Arc::new(AtomicU64::new(0));

    let task = {
        let running = Arc::clone(&running);
        let sweeps = Arc::clone(&sweeps);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let report = protection.sweep();
                let n = sweeps.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(sweep = n, removed = report.total(), "Sweep complete");
            }
        })
    };

    SweeperHandle {
        running,
        sweeps,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::EndpointTier;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let protection = Arc::new(DdosProtection::with_defaults());
        let handle = spawn_sweeper(Arc::clone(&protection), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.sweeps(), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.sweeps() >= 1);
        assert!(handle.is_running());

        handle.stop();
        tokio::task::yield_now().await;
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sweeper_does_not_sweep() {
        let protection = Arc::new(DdosProtection::with_defaults());
        protection
            .rate_limiter()
            .allow("10.0.0.1".parse().unwrap(), EndpointTier::Auth)
            .unwrap();

        let handle = spawn_sweeper(Arc::clone(&protection), Duration::from_secs(1));
        handle.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.sweeps(), 0);
        assert_eq!(protection.rate_limiter().bucket_count(), 1);
    }
}
