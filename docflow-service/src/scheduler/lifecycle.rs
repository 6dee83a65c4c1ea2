//! Shutdown and completion waiting.

use std::time::Duration;

use tracing::{error, info};

use crate::scheduler::Scheduler;

/// How often `wait_for_completion` re-checks task counts
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(25);

impl Scheduler {
    /// Stop the scheduler.
    ///
    /// New submissions are rejected, workers exit after their current task,
    /// pending retry timers are dropped (those tasks stay `Retrying`) and
    /// background maintenance runs its final pass. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping scheduler");
        }
        self.shutdown.cancel();
        self.queue.close();

        let workers = std::mem::take(&mut *self.workers());
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        self.retry_timers.close();
        self.retry_timers.wait().await;

        self.maintenance_shutdown.cancel();
        self.background.close();
        self.background.wait().await;

        let stats = self.store.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            unfinished = stats.active(),
            "Scheduler stopped"
        );
    }

    /// Wait until no task is pending, queued, processing or retrying.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let settled = async {
            while self.store.stats().active() > 0 {
                tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, settled).await.is_ok()
    }
}
