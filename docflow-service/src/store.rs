//! In-memory registry of task records.
//!
//! The store is the single authority on task state. Every read returns a
//! snapshot; every write goes through one mutex and is checked against the
//! task state machine, so updates to the same task are serialized and no
//! record can leave a terminal state.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::task::{Task, TaskId, TaskStats, TaskStatus};

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    stats: TaskStats,
    /// Ids changed since the last `drain_dirty`
    dirty: HashSet<TaskId>,
    /// Ids handed out by `drain_dirty` whose write is not yet confirmed
    in_flight: HashSet<TaskId>,
}

impl StoreInner {
    fn record_status_change(&mut self, from: Option<TaskStatus>, to: Option<TaskStatus>) {
        if from == to {
            return;
        }
        if let Some(from) = from {
            let count = self.stats.count_mut(from);
            *count = count.saturating_sub(1);
        }
        if let Some(to) = to {
            *self.stats.count_mut(to) += 1;
        }
        self.stats.total = self.tasks.len();
    }

    fn check_transition(current: &Task, next: TaskStatus) -> ServiceResult<()> {
        if current.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(ServiceError::InvalidTransition {
                task_id: current.id.clone(),
                from: current.status,
                to: next,
            })
        }
    }
}

/// Concurrency-safe task registry
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<StoreInner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave a half-written record:
        // writes replace whole tasks. Keep serving.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new task
    pub fn add(&self, task: Task) -> ServiceResult<()> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(ServiceError::DuplicateTask { task_id: task.id });
        }

        let status = task.status;
        inner.dirty.insert(task.id.clone());
        inner.tasks.insert(task.id.clone(), task);
        inner.record_status_change(None, Some(status));
        Ok(())
    }

    /// Snapshot of a task, `None` if unknown
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Replace a task record.
    ///
    /// Fails with `NotFound` for unknown ids and `InvalidTransition` when the
    /// status change is not a state machine edge or the stored record is terminal.
    pub fn update(&self, task: Task) -> ServiceResult<()> {
        let mut inner = self.lock();
        let current = inner
            .tasks
            .get(&task.id)
            .ok_or_else(|| ServiceError::NotFound {
                task_id: task.id.clone(),
            })?;
        StoreInner::check_transition(current, task.status)?;

        let from = current.status;
        let to = task.status;
        inner.dirty.insert(task.id.clone());
        inner.tasks.insert(task.id.clone(), task);
        inner.record_status_change(Some(from), Some(to));
        Ok(())
    }

    /// Atomically read, change and write back a task.
    ///
    /// `f` works on a copy; nothing is stored if it returns an error or the
    /// resulting status change is rejected. Returns whatever `f` returns.
    pub fn modify<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> ServiceResult<R>,
    ) -> ServiceResult<R> {
        let mut inner = self.lock();
        let current = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| ServiceError::NotFound {
                task_id: task_id.to_string(),
            })?;

        let mut updated = current.clone();
        let output = f(&mut updated)?;
        StoreInner::check_transition(current, updated.status)?;

        let from = current.status;
        let to = updated.status;
        updated.last_updated = Utc::now();
        inner.dirty.insert(updated.id.clone());
        inner.tasks.insert(updated.id.clone(), updated);
        inner.record_status_change(Some(from), Some(to));
        Ok(output)
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.tasks.remove(task_id) {
            Some(task) => {
                inner.dirty.remove(task_id);
                inner.in_flight.remove(task_id);
                inner.record_status_change(Some(task.status), None);
                true
            }
            None => false,
        }
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.lock()
            .tasks
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect()
    }

    /// Tasks that have been `Processing` for longer than `processing_timeout`
    pub fn list_expired(&self, processing_timeout: Duration) -> Vec<Task> {
        let Ok(timeout) = chrono::Duration::from_std(processing_timeout) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - timeout;

        self.lock()
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Processing
                    && task.started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect()
    }

    /// Remove terminal tasks that finished more than `age` ago.
    ///
    /// Tasks with changes not yet drained, or drained but not yet confirmed
    /// by [`TaskStore::finish_flush`], are kept so the final state still
    /// reaches external persistence.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return 0;
        };
        let cutoff = Utc::now() - age;

        let mut inner = self.lock();
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|task| {
                task.is_terminal()
                    && task.completed_at.is_some_and(|done| done < cutoff)
                    && !inner.dirty.contains(&task.id)
                    && !inner.in_flight.contains(&task.id)
            })
            .map(|task| task.id.clone())
            .collect();

        for task_id in &expired {
            if let Some(task) = inner.tasks.remove(task_id) {
                inner.record_status_change(Some(task.status), None);
            }
        }

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Cleaned up finished tasks");
        }
        expired.len()
    }

    /// Return and clear every task changed since the previous drain.
    ///
    /// Drained ids stay in flight until [`TaskStore::finish_flush`] confirms
    /// the write or [`TaskStore::mark_dirty`] hands them back.
    pub fn drain_dirty(&self) -> Vec<Task> {
        let mut inner = self.lock();
        let dirty = std::mem::take(&mut inner.dirty);
        let drained: Vec<Task> = dirty
            .iter()
            .filter_map(|task_id| inner.tasks.get(task_id).cloned())
            .collect();
        inner.in_flight.extend(dirty);
        drained
    }

    /// Confirm that drained tasks were written.
    pub fn finish_flush<'a>(&self, task_ids: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.lock();
        for task_id in task_ids {
            inner.in_flight.remove(task_id);
        }
    }

    /// Flag tasks as changed again, e.g. after a failed flush.
    pub fn mark_dirty<'a>(&self, task_ids: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.lock();
        for task_id in task_ids {
            inner.in_flight.remove(task_id);
            if inner.tasks.contains_key(task_id) {
                inner.dirty.insert(task_id.to_string());
            }
        }
    }

    pub fn stats(&self) -> TaskStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
