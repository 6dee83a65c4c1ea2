//! Bounded priority work queue.
//!
//! Entries are served by `(priority desc, enqueue order asc)`. Admission is
//! bounded by a semaphore: every admitted task holds an [`AdmissionPermit`]
//! from submission until it reaches a terminal state, so `capacity` limits
//! queued, in-flight and retry-waiting work together.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::{ServiceError, ServiceResult};
use crate::task::TaskId;

/// RAII guard for one admission slot. Dropping it frees the slot.
pub struct AdmissionPermit {
    #[allow(dead_code)] // held for its Drop
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish()
    }
}

/// A task handed to a worker, together with its admission slot
#[derive(Debug)]
pub struct WorkItem {
    pub task_id: TaskId,
    pub priority: i32,
    pub permit: AdmissionPermit,
}

struct QueueEntry {
    priority: i32,
    sequence: u64,
    item: WorkItem,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: higher priority wins, then the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub struct WorkQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    admission: Arc<Semaphore>,
    capacity: usize,
    next_sequence: AtomicU64,
    available: Notify,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
            next_sequence: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<QueueEntry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free admission slot.
    ///
    /// Fails with `ShuttingDown` once the queue is closed.
    pub async fn acquire(&self) -> ServiceResult<AdmissionPermit> {
        self.admission
            .clone()
            .acquire_owned()
            .await
            .map(|permit| AdmissionPermit { permit })
            .map_err(|_| ServiceError::ShuttingDown)
    }

    /// Take a free admission slot without waiting.
    pub fn try_acquire(&self) -> ServiceResult<AdmissionPermit> {
        match self.admission.clone().try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { permit }),
            Err(tokio::sync::TryAcquireError::Closed) => Err(ServiceError::ShuttingDown),
            Err(tokio::sync::TryAcquireError::NoPermits) => Err(ServiceError::CapacityExceeded {
                capacity: self.capacity,
            }),
        }
    }

    /// Push an admitted task. Never blocks: the permit already reserves its slot.
    pub fn push(&self, task_id: TaskId, priority: i32, permit: AdmissionPermit) {
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap().push(QueueEntry {
            priority,
            sequence,
            item: WorkItem {
                task_id,
                priority,
                permit,
            },
        });
        self.available.notify_one();
    }

    /// Pop the highest-priority entry, if any.
    pub fn try_pop(&self) -> Option<WorkItem> {
        let mut heap = self.heap();
        let entry = heap.pop()?;
        if !heap.is_empty() {
            // Pass the wakeup on so another idle worker picks up the rest
            self.available.notify_one();
        }
        Some(entry.item)
    }

    /// Pop the highest-priority entry, waiting at most `timeout` for one.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Remove a queued entry, releasing its admission slot.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut heap = self.heap();
        let before = heap.len();
        heap.retain(|entry| entry.item.task_id != task_id);
        before != heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admission slots currently taken
    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.admission.available_permits())
    }

    /// Reject further admissions; blocked `acquire` calls fail.
    pub fn close(&self) {
        self.admission.close();
        self.available.notify_waiters();
    }
}
