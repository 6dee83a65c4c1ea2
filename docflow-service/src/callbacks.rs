//! Progress and completion notifications.
//!
//! Callers register one [`TaskCallback`] per task at submission. Workers feed
//! it zero or more `Progress` events and exactly one `Completed` event.
//! Failing, panicking or slow callbacks are logged and never affect the task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::task::{ConversionOutput, TaskId};

/// Error type returned by callbacks
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Final outcome of a task
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { output: ConversionOutput },
    Failed { error: String },
    Cancelled,
}

/// Notification delivered to a task's callback
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress {
        task_id: TaskId,
        /// 0-100
        percent: u8,
        message: String,
    },
    Completed {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Progress { task_id, .. } | TaskEvent::Completed { task_id, .. } => task_id,
        }
    }
}

/// Receiver of task notifications
#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn on_event(&self, event: TaskEvent) -> Result<(), CallbackError>;
}

/// Adapter for callers that only have a blocking closure.
///
/// The closure runs on the blocking thread pool so it cannot stall the worker's
/// executor thread.
pub struct SyncCallback<F> {
    f: Arc<F>,
}

impl<F> SyncCallback<F>
where
    F: Fn(&TaskEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }

    /// Wrap into the shared handle `submit` takes.
    pub fn shared(f: F) -> Arc<dyn TaskCallback> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F> TaskCallback for SyncCallback<F>
where
    F: Fn(&TaskEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    async fn on_event(&self, event: TaskEvent) -> Result<(), CallbackError> {
        let f = self.f.clone();
        tokio::task::spawn_blocking(move || f(&event))
            .await
            .map_err(|e| -> CallbackError { Box::new(e) })?
    }
}

/// Deliver one event, containing every failure mode of the callback.
pub(crate) async fn dispatch(callback: &dyn TaskCallback, event: TaskEvent, timeout: Duration) {
    let task_id = event.task_id().to_string();
    let delivery = AssertUnwindSafe(callback.on_event(event)).catch_unwind();

    match tokio::time::timeout(timeout, delivery).await {
        Ok(Ok(Ok(()))) => {
            debug!(task_id = %task_id, "Callback delivered");
        }
        Ok(Ok(Err(e))) => {
            metrics::counter!("docflow_callback_failures_total", "reason" => "error").increment(1);
            warn!(task_id = %task_id, error = %e, "Task callback returned an error");
        }
        Ok(Err(_)) => {
            metrics::counter!("docflow_callback_failures_total", "reason" => "panic").increment(1);
            warn!(task_id = %task_id, "Task callback panicked");
        }
        Err(_) => {
            metrics::counter!("docflow_callback_failures_total", "reason" => "timeout")
                .increment(1);
            warn!(
                task_id = %task_id,
                timeout_secs = timeout.as_secs(),
                "Task callback timed out"
            );
        }
    }
}

/// Handle given to converters for reporting progress on one task
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    callback: Option<Arc<dyn TaskCallback>>,
    timeout: Duration,
}

impl ProgressReporter {
    pub(crate) fn new(
        task_id: TaskId,
        callback: Option<Arc<dyn TaskCallback>>,
        timeout: Duration,
    ) -> Self {
        Self {
            task_id,
            callback,
            timeout,
        }
    }

    /// Reporter that drops every update
    pub fn disabled(task_id: impl Into<TaskId>) -> Self {
        Self::new(task_id.into(), None, Duration::ZERO)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report progress; `percent` is capped at 100.
    pub async fn report(&self, percent: u8, message: impl Into<String>) {
        let Some(callback) = &self.callback else {
            return;
        };
        let event = TaskEvent::Progress {
            task_id: self.task_id.clone(),
            percent: percent.min(100),
            message: message.into(),
        };
        dispatch(callback.as_ref(), event, self.timeout).await;
    }
}
