//! Delayed re-queueing of failed attempts.

use std::sync::Arc;

use tracing::debug;

use crate::error::ServiceError;
use crate::queue::AdmissionPermit;
use crate::scheduler::Scheduler;
use crate::task::{TaskId, TaskStatus};

/// Retries go back in at the default priority.
const RETRY_PRIORITY: i32 = 0;

impl Scheduler {
    /// Re-queue a `Retrying` task after its backoff delay.
    ///
    /// The timer keeps the task's admission slot. Cancelling the task or
    /// stopping the scheduler ends the timer and releases the slot; on stop
    /// the task stays `Retrying`.
    pub(super) fn schedule_retry(
        self: &Arc<Self>,
        task_id: TaskId,
        retry_count: u32,
        permit: AdmissionPermit,
    ) {
        let delay = self.config.retry_delay(retry_count);
        let token = self.shutdown.child_token();
        self.wait_tokens.insert(task_id.clone(), token.clone());

        let scheduler = self.clone();
        self.retry_timers.spawn(async move {
            debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "Retry scheduled");

            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task_id = %task_id, "Retry timer cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            scheduler.wait_tokens.remove(&task_id);

            let requeued = scheduler.store.modify(&task_id, |task| {
                if task.status != TaskStatus::Retrying {
                    return Err(ServiceError::InvalidTransition {
                        task_id: task.id.clone(),
                        from: task.status,
                        to: TaskStatus::Queued,
                    });
                }
                task.set_status(TaskStatus::Queued);
                Ok(())
            });

            match requeued {
                Ok(()) => {
                    scheduler
                        .queue
                        .push(task_id.clone(), RETRY_PRIORITY, permit);
                    scheduler.record_queue_depth();
                    debug!(task_id = %task_id, retry_count, "Task re-queued for retry");
                }
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "Retry dropped");
                }
            }
        });
    }
}
