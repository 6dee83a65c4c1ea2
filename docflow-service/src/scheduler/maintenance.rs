//! Background maintenance: status flushing, cleanup and the stuck-task watchdog.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::archive::TaskArchive;
use crate::config::MaintenanceConfig;
use crate::error::format_error_chain_ref;
use crate::scheduler::Scheduler;
use crate::task::TaskId;

impl Scheduler {
    /// Periodically hand changed task records to `archive`.
    ///
    /// Records that fail to persist are flagged again and retried on the next
    /// tick. A final flush runs during [`Scheduler::stop`] after the workers
    /// have exited.
    pub fn spawn_status_flusher(self: &Arc<Self>, archive: Arc<dyn TaskArchive>, every: Duration) {
        let scheduler = self.clone();
        self.background.spawn(async move {
            info!(interval_secs = every.as_secs(), "Status flusher started");
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = scheduler.maintenance_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.flush_status(&archive).await;
                    }
                }
            }
            let flushed = scheduler.flush_status(&archive).await;
            info!(flushed, "Status flusher stopped after final flush");
        });
    }

    /// Drain dirty records into the archive. Returns how many were written.
    pub async fn flush_status(&self, archive: &Arc<dyn TaskArchive>) -> usize {
        let dirty = self.store.drain_dirty();
        if dirty.is_empty() {
            return 0;
        }
        let task_ids: Vec<TaskId> = dirty.iter().map(|task| task.id.clone()).collect();

        let sink = archive.clone();
        let persisted = tokio::task::spawn_blocking(move || sink.persist(&dirty)).await;

        match persisted {
            Ok(Ok(())) => {
                self.store.finish_flush(task_ids.iter().map(String::as_str));
                debug!(count = task_ids.len(), "Flushed task status");
                task_ids.len()
            }
            Ok(Err(e)) => {
                warn!(
                    count = task_ids.len(),
                    error = %format_error_chain_ref(&e),
                    "Status flush failed, will retry"
                );
                self.store.mark_dirty(task_ids.iter().map(String::as_str));
                0
            }
            Err(e) => {
                error!(error = %e, "Status flush task panicked, will retry");
                self.store.mark_dirty(task_ids.iter().map(String::as_str));
                0
            }
        }
    }

    /// Start the cleanup sweep and the watchdog.
    pub fn spawn_maintenance(self: &Arc<Self>, config: &MaintenanceConfig) {
        let scheduler = self.clone();
        let every = config.cleanup_interval();
        let retention = config.retention();
        self.background.spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = scheduler.maintenance_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = scheduler.store.cleanup_older_than(retention);
                        if removed > 0 {
                            info!(removed, "Cleaned up finished tasks");
                        }
                    }
                }
            }
        });

        let scheduler = self.clone();
        let every = config.watchdog_interval();
        self.background.spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = scheduler.maintenance_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.check_stuck_tasks();
                    }
                }
            }
        });
    }

    /// Log tasks that have been processing longer than the task timeout.
    ///
    /// Observability only: the converter owns its timeout.
    pub fn check_stuck_tasks(&self) -> usize {
        let timeout = self.config.task_timeout();
        let expired = self.store.list_expired(timeout);
        for task in &expired {
            warn!(
                task_id = %task.id,
                file_path = %task.file_path.display(),
                started_at = ?task.started_at,
                timeout_secs = timeout.as_secs(),
                "Task has been processing longer than the task timeout"
            );
        }
        metrics::gauge!("docflow_tasks_overdue").set(expired.len() as f64);
        expired.len()
    }
}
