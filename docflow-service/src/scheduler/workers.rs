//! Worker loop and conversion result handling.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::callbacks::{ProgressReporter, TaskOutcome};
use crate::converter::ConversionRequest;
use crate::error::{ConversionError, ServiceError, format_error_chain_ref};
use crate::queue::{AdmissionPermit, WorkItem};
use crate::scheduler::Scheduler;
use crate::task::{ConversionOutput, Task, TaskStatus};

impl Scheduler {
    /// Pull tasks off the queue until shutdown.
    pub(super) async fn run_worker(self: Arc<Self>, worker_id: usize) {
        info!(worker_id, "Conversion worker started");
        let poll_interval = self.config.poll_interval();

        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = self.queue.pop_timeout(poll_interval) => item,
            };
            let Some(item) = item else {
                continue;
            };
            self.record_queue_depth();
            self.process(item).await;
        }

        info!(worker_id, "Conversion worker stopped");
    }

    /// Run one conversion attempt. The admission slot is released when this
    /// returns unless the task is handed to a retry timer.
    async fn process(self: &Arc<Self>, item: WorkItem) {
        let WorkItem {
            task_id, permit, ..
        } = item;

        let claimed = self.store.modify(&task_id, |task| {
            if task.status != TaskStatus::Queued {
                return Err(ServiceError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: TaskStatus::Processing,
                });
            }
            task.set_status(TaskStatus::Processing);
            Ok(task.clone())
        });
        let task = match claimed {
            Ok(task) => task,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Skipping dequeued task");
                return;
            }
        };

        info!(
            task_id = %task.id,
            file_type = %task.file_type,
            attempt = task.retry_count + 1,
            "Processing task"
        );

        let started = Instant::now();
        let result = self.convert(&task).await;
        let elapsed = started.elapsed();
        metrics::histogram!("docflow_processing_duration_seconds").record(elapsed.as_secs_f64());

        match result {
            Ok(output) => self.complete(&task, output, elapsed).await,
            Err(e) => self.fail_attempt(&task, e, elapsed, permit).await,
        }
    }

    /// Dispatch to the registered converter, turning a panic into an error.
    async fn convert(&self, task: &Task) -> Result<ConversionOutput, ConversionError> {
        let method = self.config.method_for(task.file_type).ok_or_else(|| {
            ConversionError::NoConverter {
                method: format!("<none for {}>", task.file_type),
            }
        })?;
        let converter = self
            .converters
            .get(method)
            .ok_or_else(|| ConversionError::NoConverter {
                method: method.to_string(),
            })?;

        let request = ConversionRequest {
            task_id: task.id.clone(),
            file_path: task.file_path.clone(),
            file_type: task.file_type,
            method,
            metadata: task.metadata.clone(),
            timeout: self.config.task_timeout(),
            progress: ProgressReporter::new(
                task.id.clone(),
                self.callback_for(&task.id),
                self.config.callback_timeout(),
            ),
        };

        match AssertUnwindSafe(converter.convert(request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ConversionError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    async fn complete(&self, task: &Task, output: ConversionOutput, elapsed: Duration) {
        let duration_ms = duration_ms(elapsed);
        let stored = self.store.modify(&task.id, |record| {
            record.set_status(TaskStatus::Completed);
            record.result = Some(output.clone());
            record.error_message = None;
            record.processing_duration_ms = Some(duration_ms);
            Ok(())
        });

        if let Err(e) = stored {
            info!(task_id = %task.id, error = %e, "Conversion finished after cancellation, result discarded");
            return;
        }

        metrics::counter!("docflow_tasks_completed_total").increment(1);
        info!(
            task_id = %task.id,
            duration_ms,
            content_len = output.content.len(),
            "Task completed"
        );
        self.fire_completion(&task.id, TaskOutcome::Completed { output })
            .await;
    }

    /// Retry the task if policy allows, otherwise fail it for good.
    async fn fail_attempt(
        self: &Arc<Self>,
        task: &Task,
        error: ConversionError,
        elapsed: Duration,
        permit: AdmissionPermit,
    ) {
        let message = format_error_chain_ref(&error);
        let max_retries = self.config.max_retries;
        let retryable = error.is_retryable();

        let next = self.store.modify(&task.id, |record| {
            record.processing_duration_ms = Some(duration_ms(elapsed));
            record.error_message = Some(message.clone());
            if retryable && record.retry_count < max_retries {
                record.retry_count += 1;
                record.set_status(TaskStatus::Retrying);
                Ok(Some(record.retry_count))
            } else {
                record.set_status(TaskStatus::Failed);
                Ok(None)
            }
        });

        match next {
            Ok(Some(retry_count)) => {
                metrics::counter!("docflow_tasks_retried_total").increment(1);
                warn!(
                    task_id = %task.id,
                    retry_count,
                    max_retries,
                    error = %message,
                    "Conversion failed, will retry"
                );
                self.schedule_retry(task.id.clone(), retry_count, permit);
            }
            Ok(None) => {
                metrics::counter!("docflow_tasks_failed_total").increment(1);
                error!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    error = %message,
                    "Task failed"
                );
                self.fire_completion(&task.id, TaskOutcome::Failed { error: message })
                    .await;
            }
            Err(e) => {
                info!(task_id = %task.id, error = %e, "Conversion failed after cancellation, error discarded");
            }
        }
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
