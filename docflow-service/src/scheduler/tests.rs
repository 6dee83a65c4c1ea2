use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};
use tokio::sync::Semaphore;

use super::*;
use crate::archive::{SqliteTaskArchive, TaskArchive};
use crate::callbacks::{CallbackError, TaskEvent, TaskOutcome};
use crate::config::MaintenanceConfig;
use crate::converter::{ConversionRequest, Converter};
use crate::error::{ConversionError, DatabaseError, ServiceError, ServiceResult, ValidationError};
use crate::task::{ConversionMethod, ConversionOutput, FileType, Metadata, TaskStatus};

const SETTLE: Duration = Duration::from_secs(10);

/// Scripted converter: records every call, optionally waits on a gate, then
/// succeeds or fails.
struct Scripted {
    calls: Mutex<Vec<(String, Instant)>>,
    gate: Option<Semaphore>,
    fail: bool,
}

impl Scripted {
    fn new(gated: bool, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            gate: gated.then(|| Semaphore::new(0)),
            fail,
        })
    }

    fn succeeding() -> Arc<Self> {
        Self::new(false, false)
    }

    fn failing() -> Arc<Self> {
        Self::new(false, true)
    }

    fn gated() -> Arc<Self> {
        Self::new(true, false)
    }

    fn release(&self, attempts: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(attempts);
        }
    }

    fn names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl Converter for Scripted {
    async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutput, ConversionError> {
        let name = stem(&request.file_path);
        self.calls.lock().unwrap().push((name.clone(), Instant::now()));

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        request.progress.report(50, "halfway").await;

        if self.fail {
            return Err(ConversionError::failed("scripted failure"));
        }
        Ok(ConversionOutput {
            content: format!("# {name}"),
            metadata: Metadata::new(),
        })
    }
}

/// Panics on files named `boom`, converts everything else.
struct PanicOnBoom;

#[async_trait]
impl Converter for PanicOnBoom {
    async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutput, ConversionError> {
        if stem(&request.file_path) == "boom" {
            panic!("converter bug");
        }
        Ok(ConversionOutput::default())
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<TaskEvent>>,
}

impl EventLog {
    /// Wait until `count` completion events have arrived, then return them.
    async fn settled_completions(&self, count: usize) -> Vec<TaskOutcome> {
        let arrived = tokio::time::timeout(SETTLE, async {
            while self.completions().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(arrived.is_ok(), "expected {count} completion events");
        self.completions()
    }

    fn completions(&self) -> Vec<TaskOutcome> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                TaskEvent::Completed { outcome, .. } => Some(outcome.clone()),
                TaskEvent::Progress { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl TaskCallback for EventLog {
    async fn on_event(&self, event: TaskEvent) -> Result<(), CallbackError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct BrokenArchive;

impl TaskArchive for BrokenArchive {
    fn persist(&self, _tasks: &[crate::task::Task]) -> ServiceResult<()> {
        Err(DatabaseError::Migration {
            message: "disk full".to_string(),
        }
        .into())
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_count: 1,
        queue_capacity: 10,
        max_retries: 3,
        retry_base_delay_ms: 10,
        poll_interval_ms: 10,
        callback_timeout_secs: 2,
        ..SchedulerConfig::default()
    }
}

fn registry_with(converter: Arc<dyn Converter>) -> ConverterRegistry {
    let mut registry = ConverterRegistry::new();
    registry.register(ConversionMethod::PlainText, converter);
    registry
}

fn write_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("# {name}\n\nbody\n")).unwrap();
    path
}

async fn submit(scheduler: &Scheduler, path: &Path, priority: i32) -> TaskId {
    scheduler
        .submit(path, None, Metadata::new(), priority, None)
        .await
        .unwrap()
}

async fn wait_for_status(scheduler: &Scheduler, task_id: &str, status: TaskStatus) {
    let reached = tokio::time::timeout(SETTLE, async {
        while scheduler.get_task(task_id).map(|t| t.status) != Some(status) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "task {task_id} never reached {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_missing_file_creates_no_task() {
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));

    let err = scheduler
        .submit("/definitely/not/here.txt", None, Metadata::new(), 0, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::FileNotFound { .. })
    ));
    assert!(scheduler.store().is_empty());
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_rejects_unsupported_and_oversized_files() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.supported_types.remove(&FileType::Image);
    config.max_file_size_bytes = 64;
    let scheduler = Scheduler::start(config, registry_with(Scripted::succeeding()));

    let image = dir.path().join("photo.png");
    std::fs::write(&image, b"png").unwrap();
    let err = scheduler
        .submit(&image, None, Metadata::new(), 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "unsupported_type");

    let unknown = dir.path().join("data.xyz");
    std::fs::write(&unknown, b"?").unwrap();
    let err = scheduler
        .submit(&unknown, None, Metadata::new(), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::UnknownExtension { .. })
    ));

    let large = dir.path().join("large.txt");
    std::fs::write(&large, vec![b'a'; 100]).unwrap();
    let err = scheduler
        .submit(&large, None, Metadata::new(), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::FileTooLarge { size: 100, max: 64 })
    ));

    let err = scheduler
        .submit(dir.path(), Some(FileType::Text), Metadata::new(), 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "not_a_file");

    assert!(scheduler.store().is_empty());
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_successful_conversion_with_builtin_converter() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.md");
    std::fs::write(&path, "# Release Notes\n\nAll good.").unwrap();

    let scheduler = Scheduler::start(test_config(), ConverterRegistry::with_builtin());
    let log = Arc::new(EventLog::default());
    let mut metadata = Metadata::new();
    metadata.insert("collection".into(), "handbook".into());

    let task_id = scheduler
        .submit(&path, None, metadata, 0, Some(log.clone()))
        .await
        .unwrap();
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let task = scheduler.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.metadata["collection"], "handbook");
    assert!(task.completed_at.is_some());
    assert!(task.started_at.is_some());
    assert!(task.processing_duration_ms.is_some());
    let result = task.result.unwrap();
    assert!(result.content.starts_with("# Release Notes"));
    assert_eq!(result.metadata["title"], "Release Notes");

    let completions = log.settled_completions(1).await;
    assert_eq!(completions.len(), 1);
    assert!(matches!(completions[0], TaskOutcome::Completed { .. }));
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_converter_exhausts_retries() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "bad.txt");
    let converter = Scripted::failing();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));
    let log = Arc::new(EventLog::default());

    let task_id = scheduler
        .submit(&path, None, Metadata::new(), 0, Some(log.clone()))
        .await
        .unwrap();
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let task = scheduler.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.error_message.unwrap().contains("scripted failure"));
    assert_eq!(converter.names().len(), 4);

    let completions = log.settled_completions(1).await;
    assert_eq!(completions.len(), 1);
    assert!(matches!(&completions[0], TaskOutcome::Failed { error } if error.contains("scripted")));
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exponential_backoff_between_attempts() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "flaky.txt");
    let converter = Scripted::failing();
    let mut config = test_config();
    config.retry_base_delay_ms = 40;
    let scheduler = Scheduler::start(config, registry_with(converter.clone()));

    submit(&scheduler, &path, 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let times = converter.call_times();
    assert_eq!(times.len(), 4);
    for (k, pair) in times.windows(2).enumerate() {
        let expected = Duration::from_millis(40 * (1 << k));
        let gap = pair[1] - pair[0];
        assert!(gap >= expected, "retry {} waited {gap:?}, expected {expected:?}", k + 1);
    }
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_terminal_or_unknown_task_returns_false() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "done.txt");
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));

    let task_id = submit(&scheduler, &path, 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);
    let before = scheduler.get_task(&task_id).unwrap();

    assert!(!scheduler.cancel(&task_id).await);
    assert!(!scheduler.cancel("no-such-task").await);

    let after = scheduler.get_task(&task_id).unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.last_updated, before.last_updated);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_queued_task_never_processes() {
    let dir = tempdir().unwrap();
    let converter = Scripted::gated();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));
    let log = Arc::new(EventLog::default());

    let blocker = submit(&scheduler, &write_file(&dir, "blocker.txt"), 0).await;
    wait_for_status(&scheduler, &blocker, TaskStatus::Processing).await;

    let victim = scheduler
        .submit(&write_file(&dir, "victim.txt"), None, Metadata::new(), 0, Some(log.clone()))
        .await
        .unwrap();
    assert_eq!(scheduler.queue.in_use(), 2);

    assert!(scheduler.cancel(&victim).await);
    assert_eq!(scheduler.get_task(&victim).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(scheduler.queue.in_use(), 1);
    assert!(matches!(
        log.settled_completions(1).await.as_slice(),
        [TaskOutcome::Cancelled]
    ));

    converter.release(1);
    assert!(scheduler.wait_for_completion(SETTLE).await);
    assert_eq!(converter.names(), vec!["blocker"]);
    assert!(scheduler.get_task(&victim).unwrap().started_at.is_none());
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_processing_discards_result() {
    let dir = tempdir().unwrap();
    let converter = Scripted::gated();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));
    let log = Arc::new(EventLog::default());

    let task_id = scheduler
        .submit(&write_file(&dir, "slow.txt"), None, Metadata::new(), 0, Some(log.clone()))
        .await
        .unwrap();
    wait_for_status(&scheduler, &task_id, TaskStatus::Processing).await;

    assert!(scheduler.cancel(&task_id).await);
    converter.release(1);

    // The worker finishes and releases the slot
    let drained = tokio::time::timeout(SETTLE, async {
        while scheduler.queue.in_use() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    let task = scheduler.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result.is_none());
    assert!(matches!(
        log.settled_completions(1).await.as_slice(),
        [TaskOutcome::Cancelled]
    ));
    scheduler.stop().await;
}

/// Holds every event until the test opens the gate.
struct GatedCallback {
    gate: Semaphore,
    log: EventLog,
}

#[async_trait]
impl TaskCallback for GatedCallback {
    async fn on_event(&self, event: TaskEvent) -> Result<(), CallbackError> {
        self.gate.acquire().await.unwrap().forget();
        self.log.on_event(event).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_does_not_wait_for_slow_callback() {
    let dir = tempdir().unwrap();
    let converter = Scripted::gated();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));
    let callback = Arc::new(GatedCallback {
        gate: Semaphore::new(0),
        log: EventLog::default(),
    });

    let blocker = submit(&scheduler, &write_file(&dir, "blocker.txt"), 0).await;
    wait_for_status(&scheduler, &blocker, TaskStatus::Processing).await;
    let task_id = scheduler
        .submit(
            &write_file(&dir, "queued.txt"),
            None,
            Metadata::new(),
            0,
            Some(callback.clone()),
        )
        .await
        .unwrap();

    let cancel = scheduler.cancel(&task_id);
    let returned = tokio::time::timeout(Duration::from_millis(500), cancel).await;
    assert!(matches!(returned, Ok(true)));
    assert_eq!(scheduler.get_task(&task_id).unwrap().status, TaskStatus::Cancelled);
    assert!(callback.log.completions().is_empty());

    callback.gate.add_permits(1);
    assert!(matches!(
        callback.log.settled_completions(1).await.as_slice(),
        [TaskOutcome::Cancelled]
    ));

    converter.release(1);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_retrying_task_stops_retries() {
    let dir = tempdir().unwrap();
    let converter = Scripted::failing();
    let mut config = test_config();
    config.retry_base_delay_ms = 60_000;
    let scheduler = Scheduler::start(config, registry_with(converter.clone()));

    let task_id = submit(&scheduler, &write_file(&dir, "retry.txt"), 0).await;
    wait_for_status(&scheduler, &task_id, TaskStatus::Retrying).await;
    assert_eq!(scheduler.queue.in_use(), 1);

    assert!(scheduler.cancel(&task_id).await);

    let released = tokio::time::timeout(SETTLE, async {
        while scheduler.queue.in_use() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(released.is_ok());
    assert_eq!(converter.names().len(), 1);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_get_distinct_ids() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.worker_count = 4;
    config.queue_capacity = 50;
    let scheduler = Scheduler::start(config, registry_with(Scripted::succeeding()));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let scheduler = scheduler.clone();
            let path = write_file(&dir, &format!("doc-{i}.txt"));
            tokio::spawn(async move { submit(&scheduler, &path, 0).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 20);
    assert_eq!(scheduler.store().len(), 20);

    let stats = scheduler.stats();
    assert!(stats.finished() <= stats.total);

    assert!(scheduler.wait_for_completion(SETTLE).await);
    let stats = scheduler.stats();
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.finished(), stats.total);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_blocks_at_capacity() {
    let dir = tempdir().unwrap();
    let converter = Scripted::gated();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));

    for i in 0..10 {
        submit(&scheduler, &write_file(&dir, &format!("fill-{i}.txt")), 0).await;
    }

    let overflow_path = write_file(&dir, "overflow.txt");
    let err = scheduler
        .try_submit(&overflow_path, None, Metadata::new(), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CapacityExceeded { capacity: 10 }));

    let blocked = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { submit(&scheduler, &overflow_path, 0).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());
    assert_eq!(scheduler.stats().pending, 1);

    converter.release(1);
    let overflow_id = tokio::time::timeout(SETTLE, blocked)
        .await
        .expect("submit stayed blocked after a slot freed")
        .unwrap();

    converter.release(100);
    assert!(scheduler.wait_for_completion(SETTLE).await);
    assert_eq!(
        scheduler.get_task(&overflow_id).unwrap().status,
        TaskStatus::Completed
    );
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_higher_priority_served_first() {
    let dir = tempdir().unwrap();
    let converter = Scripted::gated();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));

    let blocker = submit(&scheduler, &write_file(&dir, "blocker.txt"), 0).await;
    wait_for_status(&scheduler, &blocker, TaskStatus::Processing).await;

    submit(&scheduler, &write_file(&dir, "low.txt"), 1).await;
    submit(&scheduler, &write_file(&dir, "high.txt"), 5).await;
    submit(&scheduler, &write_file(&dir, "low-again.txt"), 1).await;

    converter.release(10);
    assert!(scheduler.wait_for_completion(SETTLE).await);
    assert_eq!(converter.names(), vec!["blocker", "high", "low", "low-again"]);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_converter_fails_task_and_worker_survives() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.max_retries = 0;
    let scheduler = Scheduler::start(config, registry_with(Arc::new(PanicOnBoom)));

    let boom = submit(&scheduler, &write_file(&dir, "boom.txt"), 0).await;
    let fine = submit(&scheduler, &write_file(&dir, "fine.txt"), 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let boom = scheduler.get_task(&boom).unwrap();
    assert_eq!(boom.status, TaskStatus::Failed);
    assert!(boom.error_message.unwrap().contains("converter bug"));
    assert_eq!(
        scheduler.get_task(&fine).unwrap().status,
        TaskStatus::Completed
    );
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_converter_fails_without_retry() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::start(test_config(), ConverterRegistry::new());

    let task_id = submit(&scheduler, &write_file(&dir, "orphan.txt"), 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let task = scheduler.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.error_message.unwrap().contains("plain_text"));
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_precedes_single_completion() {
    let dir = tempdir().unwrap();
    let converter = Scripted::failing();
    let mut config = test_config();
    config.max_retries = 1;
    let scheduler = Scheduler::start(config, registry_with(converter));
    let log = Arc::new(EventLog::default());

    scheduler
        .submit(&write_file(&dir, "steps.txt"), None, Metadata::new(), 0, Some(log.clone()))
        .await
        .unwrap();
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let events = log.events.lock().unwrap();
    // One progress event per attempt, then the completion
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], TaskEvent::Progress { percent: 50, .. }));
    assert!(matches!(events[1], TaskEvent::Progress { .. }));
    assert!(matches!(events[2], TaskEvent::Completed { .. }));
    drop(events);
    assert!(scheduler.callbacks.is_empty());
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_batch_reports_partial_failures() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));

    let paths = vec![
        write_file(&dir, "a.txt"),
        dir.path().join("missing.txt"),
        write_file(&dir, "b.md"),
    ];
    let mut tagged = Metadata::new();
    tagged.insert("batch".into(), 7.into());
    let metadatas = vec![tagged, Metadata::new(), Metadata::new()];

    let batch = scheduler
        .submit_batch(paths.clone(), Some(metadatas), 2)
        .await
        .unwrap();
    assert_eq!(batch.task_ids.len(), 2);
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].0, paths[1]);

    let first = scheduler.get_task(&batch.task_ids[0]).unwrap();
    assert_eq!(first.metadata["batch"], 7);
    assert_eq!(first.priority, 2);

    let err = scheduler
        .submit_batch(paths, Some(vec![Metadata::new()]), 0)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "batch_mismatch");
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_for_completion_times_out() {
    let dir = tempdir().unwrap();
    let converter = Scripted::gated();
    let scheduler = Scheduler::start(test_config(), registry_with(converter.clone()));

    submit(&scheduler, &write_file(&dir, "stuck.txt"), 0).await;
    assert!(!scheduler.wait_for_completion(Duration::from_millis(50)).await);

    converter.release(1);
    assert!(scheduler.wait_for_completion(SETTLE).await);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_rejects_submissions_and_leaves_retrying_tasks() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.retry_base_delay_ms = 60_000;
    let scheduler = Scheduler::start(config, registry_with(Scripted::failing()));

    let task_id = submit(&scheduler, &write_file(&dir, "later.txt"), 0).await;
    wait_for_status(&scheduler, &task_id, TaskStatus::Retrying).await;

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
        .await
        .expect("stop waited on the retry timer");
    assert_eq!(
        scheduler.get_task(&task_id).unwrap().status,
        TaskStatus::Retrying
    );

    let err = scheduler
        .submit(&write_file(&dir, "too-late.txt"), None, Metadata::new(), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ShuttingDown));

    // Second stop is a no-op
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_flush_writes_archive() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));
    let archive = Arc::new(SqliteTaskArchive::open(&dir.path().join("tasks.db")).unwrap());
    let sink: Arc<dyn TaskArchive> = archive.clone();

    let task_id = submit(&scheduler, &write_file(&dir, "saved.txt"), 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);

    assert_eq!(scheduler.flush_status(&sink).await, 1);
    assert_eq!(scheduler.flush_status(&sink).await, 0);

    let archived = archive.load_task(&task_id).unwrap().unwrap();
    assert_eq!(archived.status, TaskStatus::Completed);
    assert_eq!(archived.result.unwrap().content, "# saved");
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_flush_keeps_records_dirty() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));
    let broken: Arc<dyn TaskArchive> = Arc::new(BrokenArchive);

    let task_id = submit(&scheduler, &write_file(&dir, "unsaved.txt"), 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);

    assert_eq!(scheduler.flush_status(&broken).await, 0);

    let still_dirty = scheduler.store().drain_dirty();
    assert_eq!(still_dirty.len(), 1);
    assert_eq!(still_dirty[0].id, task_id);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_maintenance_keeps_finished_tasks_until_archived() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));
    scheduler.spawn_maintenance(&MaintenanceConfig {
        cleanup_interval_secs: 1,
        retention_secs: 0,
        watchdog_interval_secs: 1,
    });

    let task_id = submit(&scheduler, &write_file(&dir, "kept.txt"), 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);

    let broken: Arc<dyn TaskArchive> = Arc::new(BrokenArchive);
    assert_eq!(scheduler.flush_status(&broken).await, 0);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(scheduler.get_task(&task_id).is_some());

    let archive = Arc::new(SqliteTaskArchive::open_in_memory().unwrap());
    let sink: Arc<dyn TaskArchive> = archive.clone();
    assert_eq!(scheduler.flush_status(&sink).await, 1);
    let purged = tokio::time::timeout(SETTLE, async {
        while scheduler.get_task(&task_id).is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(purged.is_ok());
    assert_eq!(
        archive.load_task(&task_id).unwrap().unwrap().status,
        TaskStatus::Completed
    );
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_runs_final_flush() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));
    let archive = Arc::new(SqliteTaskArchive::open_in_memory().unwrap());
    scheduler.spawn_status_flusher(archive.clone(), Duration::from_secs(3600));

    let task_id = submit(&scheduler, &write_file(&dir, "final.txt"), 0).await;
    assert!(scheduler.wait_for_completion(SETTLE).await);
    scheduler.stop().await;

    let archived = archive.load_task(&task_id).unwrap().unwrap();
    assert_eq!(archived.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watchdog_reports_nothing_when_idle() {
    let scheduler = Scheduler::start(test_config(), registry_with(Scripted::succeeding()));
    assert_eq!(scheduler.check_stuck_tasks(), 0);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_plain_text_converter_registered_for_text() {
    let registry = ConverterRegistry::with_builtin();
    let scheduler = Scheduler::start(test_config(), registry);
    let method = scheduler.config().method_for(FileType::Text).unwrap();
    assert_eq!(method, ConversionMethod::PlainText);
    assert!(scheduler.converters.get(method).is_some());
    scheduler.stop().await;
}
