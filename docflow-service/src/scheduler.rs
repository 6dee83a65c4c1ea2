//! Task scheduling and execution.
//!
//! The [`Scheduler`] owns the priority work queue, a fixed pool of worker
//! tasks, retry timers and the per-task callback registry. It is the only
//! writer of task status; every transition goes through the [`TaskStore`].
//!
//! - Submission and validation
//! - Worker loop and result handling
//! - Retry with backoff
//! - Cancellation
//! - Shutdown
//! - Background maintenance (status flushing, cleanup, watchdog)

mod cancellation;
mod lifecycle;
mod maintenance;
mod retry;
mod submit;
mod workers;

#[cfg(test)]
mod tests;

pub use submit::BatchSubmission;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::callbacks::{self, TaskCallback, TaskEvent, TaskOutcome};
use crate::config::SchedulerConfig;
use crate::converter::ConverterRegistry;
use crate::queue::WorkQueue;
use crate::store::TaskStore;
use crate::task::{Task, TaskId, TaskStats};

/// Asynchronous conversion scheduler.
///
/// Created with [`Scheduler::start`] and shared through an `Arc`. Call
/// [`Scheduler::stop`] before dropping the last handle; workers hold a
/// reference until they exit.
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    store: Arc<TaskStore>,
    queue: Arc<WorkQueue>,
    converters: ConverterRegistry,
    /// Completion listeners, removed when the completion event fires
    callbacks: DashMap<TaskId, Arc<dyn TaskCallback>>,
    /// Tokens for tasks parked outside the queue (waiting for admission or
    /// for a retry timer) so `cancel` can wake them
    wait_tokens: DashMap<TaskId, CancellationToken>,
    /// Stops workers, admission waits and retry timers
    shutdown: CancellationToken,
    /// Stops background maintenance once workers are gone
    maintenance_shutdown: CancellationToken,
    retry_timers: TaskTracker,
    background: TaskTracker,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a scheduler and its worker pool.
    ///
    /// Out-of-range config values are clamped. Must be called inside a tokio
    /// runtime.
    pub fn start(config: SchedulerConfig, converters: ConverterRegistry) -> Arc<Self> {
        let config = config.validated();

        for (file_type, method) in &config.supported_types {
            if converters.get(*method).is_none() {
                warn!(
                    file_type = %file_type,
                    method = %method,
                    "No converter registered for supported file type; its tasks will fail"
                );
            }
        }

        let scheduler = Arc::new(Self {
            store: Arc::new(TaskStore::new()),
            queue: Arc::new(WorkQueue::new(config.queue_capacity)),
            config: Arc::new(config),
            converters,
            callbacks: DashMap::new(),
            wait_tokens: DashMap::new(),
            shutdown: CancellationToken::new(),
            maintenance_shutdown: CancellationToken::new(),
            retry_timers: TaskTracker::new(),
            background: TaskTracker::new(),
            workers: Mutex::new(Vec::new()),
        });

        let handles: Vec<JoinHandle<()>> = (0..scheduler.config.worker_count)
            .map(|worker_id| tokio::spawn(scheduler.clone().run_worker(worker_id)))
            .collect();
        *scheduler.workers() = handles;

        info!(
            workers = scheduler.config.worker_count,
            queue_capacity = scheduler.config.queue_capacity,
            max_retries = scheduler.config.max_retries,
            "Scheduler started"
        );

        scheduler
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Snapshot of a task
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.store.get(task_id)
    }

    pub fn stats(&self) -> TaskStats {
        self.store.stats()
    }

    /// The underlying task store, for queries beyond `get_task`
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Whether `stop` has been called
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn callback_for(&self, task_id: &str) -> Option<Arc<dyn TaskCallback>> {
        self.callbacks.get(task_id).map(|entry| entry.value().clone())
    }

    /// Deliver the completion event and drop the registration.
    ///
    /// Removing the entry first makes delivery at-most-once even if two
    /// paths race to finish the same task.
    async fn fire_completion(&self, task_id: &str, outcome: TaskOutcome) {
        let Some((_, callback)) = self.callbacks.remove(task_id) else {
            return;
        };
        let event = TaskEvent::Completed {
            task_id: task_id.to_string(),
            outcome,
        };
        callbacks::dispatch(callback.as_ref(), event, self.config.callback_timeout()).await;
    }

    /// Like `fire_completion`, but delivers on a background task so the
    /// caller does not wait on the callback.
    fn spawn_completion(&self, task_id: &str, outcome: TaskOutcome) {
        let Some((_, callback)) = self.callbacks.remove(task_id) else {
            return;
        };
        let event = TaskEvent::Completed {
            task_id: task_id.to_string(),
            outcome,
        };
        let timeout = self.config.callback_timeout();
        self.background.spawn(async move {
            callbacks::dispatch(callback.as_ref(), event, timeout).await;
        });
    }

    fn record_queue_depth(&self) {
        metrics::gauge!("docflow_queue_depth").set(self.queue.len() as f64);
    }
}
