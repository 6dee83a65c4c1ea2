//! Task submission and input validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::callbacks::{TaskCallback, TaskOutcome};
use crate::error::{ServiceError, ServiceResult, ValidationError};
use crate::queue::AdmissionPermit;
use crate::scheduler::Scheduler;
use crate::task::{FileType, Metadata, Task, TaskId, TaskStatus};

/// Outcome of [`Scheduler::submit_batch`]
#[derive(Debug, Default)]
pub struct BatchSubmission {
    /// IDs of the tasks that were created, in input order
    pub task_ids: Vec<TaskId>,
    /// Files that were rejected, with the reason
    pub failures: Vec<(PathBuf, ServiceError)>,
}

impl Scheduler {
    /// Submit a file for conversion.
    ///
    /// The file type is detected from the extension when `file_type` is
    /// `None`. Validation failures return immediately and create no task.
    /// Waits while the queue is at capacity.
    pub async fn submit(
        &self,
        file_path: impl AsRef<Path>,
        file_type: Option<FileType>,
        metadata: Metadata,
        priority: i32,
        callback: Option<Arc<dyn TaskCallback>>,
    ) -> ServiceResult<TaskId> {
        if self.is_stopping() {
            return Err(ServiceError::ShuttingDown);
        }
        let (file_path, file_type) = self.validate(file_path.as_ref(), file_type).await?;

        let task = Task::new(file_path, file_type, metadata, priority);
        let task_id = task.id.clone();

        // Registered before the task exists so a cancel can always find it
        let wait_token = self.shutdown.child_token();
        self.wait_tokens.insert(task_id.clone(), wait_token.clone());
        if let Err(e) = self.register(task, callback) {
            self.wait_tokens.remove(&task_id);
            return Err(e);
        }

        let admitted = tokio::select! {
            permit = self.queue.acquire() => permit,
            _ = wait_token.cancelled() => Err(ServiceError::ShuttingDown),
        };
        self.wait_tokens.remove(&task_id);

        match admitted {
            Ok(permit) => {
                self.enqueue(&task_id, priority, permit);
                Ok(task_id)
            }
            Err(e) if self.is_stopping() => {
                self.abandon(&task_id).await;
                Err(e)
            }
            // Cancelled while waiting for a slot; the caller still gets the ID
            Err(_) => Ok(task_id),
        }
    }

    /// Submit without waiting: fails with `CapacityExceeded` when full.
    pub async fn try_submit(
        &self,
        file_path: impl AsRef<Path>,
        file_type: Option<FileType>,
        metadata: Metadata,
        priority: i32,
        callback: Option<Arc<dyn TaskCallback>>,
    ) -> ServiceResult<TaskId> {
        if self.is_stopping() {
            return Err(ServiceError::ShuttingDown);
        }
        let (file_path, file_type) = self.validate(file_path.as_ref(), file_type).await?;
        let permit = self.queue.try_acquire()?;

        let task = Task::new(file_path, file_type, metadata, priority);
        let task_id = task.id.clone();
        self.register(task, callback)?;
        self.enqueue(&task_id, priority, permit);
        Ok(task_id)
    }

    /// Submit several files independently at one priority.
    ///
    /// `metadatas`, when given, must have one entry per path. A rejected
    /// file does not stop the rest of the batch.
    pub async fn submit_batch(
        &self,
        paths: Vec<PathBuf>,
        metadatas: Option<Vec<Metadata>>,
        priority: i32,
    ) -> ServiceResult<BatchSubmission> {
        if let Some(metadatas) = &metadatas
            && metadatas.len() != paths.len()
        {
            return Err(ValidationError::BatchMismatch {
                paths: paths.len(),
                metadatas: metadatas.len(),
            }
            .into());
        }

        let mut metadatas = metadatas.map(Vec::into_iter);
        let mut batch = BatchSubmission::default();

        for path in paths {
            let metadata = metadatas
                .as_mut()
                .and_then(Iterator::next)
                .unwrap_or_default();
            match self.submit(&path, None, metadata, priority, None).await {
                Ok(task_id) => batch.task_ids.push(task_id),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Batch entry rejected");
                    batch.failures.push((path, e));
                }
            }
        }

        info!(
            submitted = batch.task_ids.len(),
            rejected = batch.failures.len(),
            "Batch submitted"
        );
        Ok(batch)
    }

    /// Check that the file exists, fits the size limit and has a supported type.
    async fn validate(
        &self,
        file_path: &Path,
        file_type: Option<FileType>,
    ) -> Result<(PathBuf, FileType), ValidationError> {
        let metadata = match tokio::fs::metadata(file_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ValidationError::FileNotFound {
                    path: file_path.to_path_buf(),
                });
            }
            Err(e) => return Err(ValidationError::Io(e)),
        };

        if !metadata.is_file() {
            return Err(ValidationError::NotAFile {
                path: file_path.to_path_buf(),
            });
        }

        let max = self.config.max_file_size_bytes;
        if metadata.len() > max {
            return Err(ValidationError::FileTooLarge {
                size: metadata.len(),
                max,
            });
        }

        let file_type = match file_type {
            Some(file_type) => file_type,
            None => FileType::from_path(file_path).ok_or_else(|| {
                ValidationError::UnknownExtension {
                    path: file_path.to_path_buf(),
                }
            })?,
        };
        if !self.config.is_supported(file_type) {
            return Err(ValidationError::UnsupportedType { file_type });
        }

        Ok((file_path.to_path_buf(), file_type))
    }

    /// Record a new task and its callback.
    fn register(&self, task: Task, callback: Option<Arc<dyn TaskCallback>>) -> ServiceResult<()> {
        let task_id = task.id.clone();
        let file_type = task.file_type;
        let priority = task.priority;

        if let Some(callback) = callback {
            self.callbacks.insert(task_id.clone(), callback);
        }
        if let Err(e) = self.store.add(task) {
            self.callbacks.remove(&task_id);
            return Err(e);
        }

        metrics::counter!("docflow_tasks_submitted_total").increment(1);
        info!(task_id = %task_id, file_type = %file_type, priority, "Task submitted");
        Ok(())
    }

    /// Move an admitted task to `Queued` and push it.
    ///
    /// A task cancelled in the meantime is left alone and its slot released.
    pub(super) fn enqueue(&self, task_id: &str, priority: i32, permit: AdmissionPermit) -> bool {
        let queued = self.store.modify(task_id, |task| {
            task.set_status(TaskStatus::Queued);
            Ok(())
        });

        match queued {
            Ok(()) => {
                self.queue.push(task_id.to_string(), priority, permit);
                self.record_queue_depth();
                debug!(task_id = %task_id, priority, "Task queued");
                true
            }
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Task not queued, releasing slot");
                false
            }
        }
    }

    /// Cancel a task that was still waiting for admission when the scheduler stopped.
    async fn abandon(&self, task_id: &str) {
        let cancelled = self.store.modify(task_id, |task| {
            task.set_status(TaskStatus::Cancelled);
            task.error_message = Some("Scheduler stopped before the task was queued".to_string());
            Ok(())
        });
        if cancelled.is_ok() {
            metrics::counter!("docflow_tasks_cancelled_total").increment(1);
            self.fire_completion(task_id, TaskOutcome::Cancelled).await;
        }
    }
}
