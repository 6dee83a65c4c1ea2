//! Asynchronous document-to-Markdown conversion engine.
//!
//! Files are submitted to a [`Scheduler`], which validates them, orders them
//! in a bounded priority queue and converts them on a fixed pool of workers
//! through pluggable [`Converter`]s. Failed attempts are retried with
//! backoff; progress and completion are reported through [`TaskCallback`]s.

pub mod archive;
pub mod auto_import;
pub mod callbacks;
pub mod config;
pub mod converter;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod task;

pub use archive::{SqliteTaskArchive, TaskArchive};
pub use callbacks::{
    CallbackError, ProgressReporter, SyncCallback, TaskCallback, TaskEvent, TaskOutcome,
};
pub use config::{SchedulerConfig, ServiceConfig};
pub use converter::{ConversionRequest, Converter, ConverterRegistry};
pub use error::{ConversionError, ServiceError, ServiceResult, ValidationError};
pub use scheduler::{BatchSubmission, Scheduler};
pub use store::TaskStore;
pub use task::{
    ConversionMethod, ConversionOutput, FileType, Metadata, Task, TaskId, TaskStats, TaskStatus,
};
