//! Task records and the enums that describe them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Opaque task identifier (UUID v4 string)
pub type TaskId = String;

/// Caller-supplied metadata, passed through to the converter untouched
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Closed set of input file types
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Word,
    Excel,
    PowerPoint,
    Csv,
    Html,
    Markdown,
    Text,
    Json,
    Image,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Detect the file type from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        let file_type = match ext.as_str() {
            "pdf" => FileType::Pdf,
            "doc" | "docx" => FileType::Word,
            "xls" | "xlsx" => FileType::Excel,
            "ppt" | "pptx" => FileType::PowerPoint,
            "csv" => FileType::Csv,
            "htm" | "html" => FileType::Html,
            "md" | "markdown" => FileType::Markdown,
            "txt" | "text" => FileType::Text,
            "json" => FileType::Json,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => FileType::Image,
            _ => return None,
        };
        Some(file_type)
    }
}

/// Conversion strategy tag. Each tag is served by one registered converter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversionMethod {
    PdfExtract,
    OfficeDocument,
    Spreadsheet,
    Html,
    PlainText,
    ImageCaption,
}

/// Task lifecycle status
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet on the work queue
    Pending,
    /// Waiting on the work queue
    Queued,
    /// Claimed by a worker
    Processing,
    Completed,
    Failed,
    Cancelled,
    /// Failed attempt, waiting for the backoff delay before re-queueing
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// Staying in the same non-terminal status is allowed so progress and
    /// bookkeeping updates can be written.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Processing, Cancelled)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }
}

/// Successful converter output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionOutput {
    /// Markdown content
    pub content: String,
    /// Converter-produced metadata (title, page counts, ...)
    #[serde(default)]
    pub metadata: Metadata,
}

/// A single file-to-Markdown conversion request and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub file_path: PathBuf,
    pub file_type: FileType,
    #[serde(default)]
    pub metadata: Metadata,
    pub priority: i32,
    pub retry_count: u32,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConversionOutput>,
    /// Wall time of the most recent conversion attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl Task {
    /// Create a new `Pending` task with a fresh id.
    pub fn new(file_path: PathBuf, file_type: FileType, metadata: Metadata, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            file_path,
            file_type,
            metadata,
            priority,
            retry_count: 0,
            status: TaskStatus::Pending,
            error_message: None,
            result: None,
            processing_duration_ms: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_updated: now,
        }
    }

    /// Set the status and maintain the timestamps that depend on it.
    ///
    /// `completed_at` is set exactly when the new status is terminal.
    /// Does not check the transition; the store does that.
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        if status == TaskStatus::Processing {
            self.started_at = Some(now);
        }
        self.completed_at = status.is_terminal().then_some(now);
        self.status = status;
        self.last_updated = now;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Snapshot of per-status task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStats {
    /// Tasks that have not reached a terminal state
    pub fn active(&self) -> usize {
        self.pending + self.queued + self.processing + self.retrying
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub(crate) fn count_mut(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::Processing => &mut self.processing,
            TaskStatus::Retrying => &mut self.retrying,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
        }
    }
}
