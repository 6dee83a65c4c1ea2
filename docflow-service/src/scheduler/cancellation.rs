//! Task cancellation.

use tracing::info;

use crate::callbacks::TaskOutcome;
use crate::scheduler::Scheduler;
use crate::task::TaskStatus;

impl Scheduler {
    /// Cancel a task.
    ///
    /// Returns `false` for unknown or already terminal tasks. Otherwise the
    /// task is `Cancelled` on return and its slot is released. A conversion
    /// already running is left to finish and its result is discarded.
    ///
    /// The `Cancelled` completion event is delivered in the background, so a
    /// slow callback does not hold up the caller.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let previous = self.store.modify(task_id, |task| {
            let previous = task.status;
            task.set_status(TaskStatus::Cancelled);
            Ok(previous)
        });
        let Ok(previous) = previous else {
            return false;
        };

        match previous {
            TaskStatus::Queued => {
                self.queue.remove(task_id);
                self.record_queue_depth();
            }
            TaskStatus::Pending | TaskStatus::Retrying => {
                if let Some((_, token)) = self.wait_tokens.remove(task_id) {
                    token.cancel();
                }
            }
            _ => {}
        }

        metrics::counter!("docflow_tasks_cancelled_total").increment(1);
        info!(task_id = %task_id, previous_status = %previous, "Task cancelled");

        self.spawn_completion(task_id, TaskOutcome::Cancelled);
        true
    }
}
