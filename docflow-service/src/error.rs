use std::path::PathBuf;

use thiserror::Error;

use crate::task::{FileType, TaskStatus};

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid submission")]
    Validation(#[from] ValidationError),

    #[error("Conversion failed")]
    Conversion(#[from] ConversionError),

    #[error("Task already exists: {task_id}")]
    DuplicateTask { task_id: String },

    #[error("Task not found: {task_id}")]
    NotFound { task_id: String },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Work queue is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Submission-time errors. These never create a task.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Not a regular file: {}", path.display())]
    NotAFile { path: PathBuf },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Unsupported file type: {file_type}")]
    UnsupportedType { file_type: FileType },

    #[error("Unrecognized file extension: {}", path.display())]
    UnknownExtension { path: PathBuf },

    #[error("Batch has {paths} paths but {metadatas} metadata entries")]
    BatchMismatch { paths: usize, metadatas: usize },

    #[error("IO error")]
    Io(#[source] std::io::Error),
}

/// Errors from one conversion attempt
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("{message}")]
    Failed { message: String },

    #[error("Conversion timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Converter panicked: {message}")]
    Panicked { message: String },

    #[error("No converter registered for method {method}")]
    NoConverter { method: String },

    #[error("IO error")]
    Io(#[source] std::io::Error),
}

impl ConversionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ConversionError::Failed {
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed. A missing converter stays missing.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConversionError::NoConverter { .. })
    }
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

impl ServiceError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Validation(ValidationError::FileNotFound { .. }) => "file_not_found",
            ServiceError::Validation(ValidationError::NotAFile { .. }) => "not_a_file",
            ServiceError::Validation(ValidationError::FileTooLarge { .. }) => "file_too_large",
            ServiceError::Validation(ValidationError::UnsupportedType { .. })
            | ServiceError::Validation(ValidationError::UnknownExtension { .. }) => {
                "unsupported_type"
            }
            ServiceError::Validation(ValidationError::BatchMismatch { .. }) => "batch_mismatch",
            ServiceError::Validation(ValidationError::Io(_)) => "io_error",
            ServiceError::Conversion(ConversionError::Timeout { .. }) => "conversion_timeout",
            ServiceError::Conversion(_) => "conversion_error",
            ServiceError::DuplicateTask { .. } => "duplicate_task",
            ServiceError::NotFound { .. } => "task_not_found",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::CapacityExceeded { .. } => "capacity_exceeded",
            ServiceError::ShuttingDown => "shutting_down",
            ServiceError::Database(_) => "database_error",
            ServiceError::Config { .. } => "config_error",
        }
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error followed by its `source()` chain, separated by `: `.
pub fn format_error_chain_ref(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
