//! Auto-import directory watcher.
//!
//! Recursively polls a configured directory and submits every supported file
//! it has not submitted before. Files are left in place for the converters.
//! Files that fail validation are moved to a `failed/` subdirectory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult, ValidationError};
use crate::scheduler::Scheduler;
use crate::task::{FileType, Metadata};

/// Directory to skip when scanning (case-insensitive)
const FAILED_DIRECTORY: &str = "failed";

/// Start the auto-import worker.
///
/// Runs until the scheduler stops.
pub fn start_auto_import_worker(
    scheduler: Arc<Scheduler>,
    auto_import_dir: PathBuf,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %auto_import_dir.display(), "Auto-import worker started");

        if let Err(e) = std::fs::create_dir_all(auto_import_dir.join(FAILED_DIRECTORY)) {
            error!(error = %e, "Failed to create auto-import failed directory, worker stopping");
            return;
        }

        let mut importer = AutoImporter::new(scheduler.clone(), auto_import_dir);
        while !scheduler.is_stopping() {
            match importer.scan_once().await {
                Ok(0) => {}
                Ok(submitted) => info!(submitted, "Auto-import submitted files"),
                Err(ServiceError::ShuttingDown) => break,
                Err(e) => error!(error = %e, "Auto-import scan error"),
            }
            tokio::time::sleep(poll_interval).await;
        }

        info!("Auto-import worker stopped");
    })
}

/// Scans one directory tree and remembers what it has submitted
pub struct AutoImporter {
    scheduler: Arc<Scheduler>,
    root: PathBuf,
    submitted: HashSet<PathBuf>,
}

impl AutoImporter {
    pub fn new(scheduler: Arc<Scheduler>, root: PathBuf) -> Self {
        Self {
            scheduler,
            root,
            submitted: HashSet::new(),
        }
    }

    /// Submit every new supported file. Returns how many were submitted.
    pub async fn scan_once(&mut self) -> ServiceResult<usize> {
        let mut files = Vec::new();
        collect_files_recursive(&self.root, &self.root, &mut files)
            .map_err(|e| ServiceError::Validation(ValidationError::Io(e)))?;

        // Forget files that have been removed so a re-added file is picked up again
        self.submitted.retain(|path| path.exists());

        files.sort();
        let mut count = 0;
        for file_path in files {
            if self.submitted.contains(&file_path) || !self.is_supported(&file_path) {
                continue;
            }

            let relative = file_path
                .strip_prefix(&self.root)
                .unwrap_or(&file_path)
                .display()
                .to_string();
            let mut metadata = Metadata::new();
            metadata.insert("source".into(), Value::from("auto_import"));
            metadata.insert("relative_path".into(), Value::from(relative.clone()));

            debug!(file = %relative, "Submitting auto-import file");
            match self.scheduler.submit(&file_path, None, metadata, 0, None).await {
                Ok(task_id) => {
                    info!(file = %relative, task_id = %task_id, "Auto-imported file queued");
                    self.submitted.insert(file_path);
                    count += 1;
                }
                Err(ServiceError::Validation(e)) => {
                    warn!(file = %relative, error = %e, "Auto-import rejected file");
                    move_to_failed(&file_path, &self.root);
                    cleanup_empty_dirs(file_path.parent(), &self.root);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(count)
    }

    fn is_supported(&self, path: &Path) -> bool {
        FileType::from_path(path).is_some_and(|t| self.scheduler.config().is_supported(t))
    }
}

/// Recursively collect all files from a directory, skipping the failed/ directory.
fn collect_files_recursive(dir: &Path, base_dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let entries = std::fs::read_dir(dir)?;

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && path.parent() == Some(base_dir)
                && name.eq_ignore_ascii_case(FAILED_DIRECTORY)
            {
                continue;
            }
            collect_files_recursive(&path, base_dir, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }

    Ok(())
}

/// Move a file to the failed/ directory, preserving its relative path structure.
fn move_to_failed(file_path: &Path, base_dir: &Path) {
    let relative = file_path.strip_prefix(base_dir).unwrap_or(file_path);
    let dest = base_dir.join(FAILED_DIRECTORY).join(relative);

    if let Some(parent) = dest.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(
            dest = %parent.display(),
            error = %e,
            "Failed to create directory in failed/"
        );
        return;
    }

    if let Err(e) = std::fs::rename(file_path, &dest) {
        warn!(
            file = %file_path.display(),
            dest = %dest.display(),
            error = %e,
            "Failed to move file to failed/, attempting copy"
        );
        // Cross-filesystem moves need copy + delete
        if let Err(copy_err) = std::fs::copy(file_path, &dest) {
            warn!(
                file = %file_path.display(),
                error = %copy_err,
                "Failed to copy file to failed/, leaving in place"
            );
            return;
        }
        if let Err(del_err) = std::fs::remove_file(file_path) {
            warn!(
                file = %file_path.display(),
                error = %del_err,
                "Failed to delete original file after copy"
            );
        }
    }
}

/// Remove empty directories up to (but not including) the base directory.
fn cleanup_empty_dirs(start: Option<&Path>, base_dir: &Path) {
    let Some(mut dir) = start else { return };

    while dir != base_dir && dir.starts_with(base_dir) {
        if let Some(name) = dir.file_name().and_then(|n| n.to_str())
            && name.eq_ignore_ascii_case(FAILED_DIRECTORY)
        {
            break;
        }

        if std::fs::remove_dir(dir).is_err() {
            // Not empty
            break;
        }
        debug!(dir = %dir.display(), "Removed empty directory");

        dir = match dir.parent() {
            Some(p) => p,
            None => break,
        };
    }
}
