//! Conversion strategies.
//!
//! Each [`ConversionMethod`] is served by one [`Converter`] registered in a
//! [`ConverterRegistry`]. The scheduler looks the strategy up per task; it
//! never branches on file formats itself.

mod csv;
mod text;

pub use csv::CsvConverter;
pub use text::PlainTextConverter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::callbacks::ProgressReporter;
use crate::error::ConversionError;
use crate::task::{ConversionMethod, ConversionOutput, FileType, Metadata, TaskId};

/// Everything a converter needs for one attempt
#[derive(Clone)]
pub struct ConversionRequest {
    pub task_id: TaskId,
    pub file_path: PathBuf,
    pub file_type: FileType,
    pub method: ConversionMethod,
    pub metadata: Metadata,
    /// Budget for this attempt. Converters are expected to give up with
    /// `ConversionError::Timeout` rather than run past it.
    pub timeout: Duration,
    pub progress: ProgressReporter,
}

/// Format-specific conversion to Markdown.
///
/// Called concurrently from several workers.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutput, ConversionError>;
}

/// Method tag → strategy
#[derive(Default, Clone)]
pub struct ConverterRegistry {
    converters: HashMap<ConversionMethod, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the converters that ship with this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(ConversionMethod::PlainText, Arc::new(PlainTextConverter))
            .register(ConversionMethod::Spreadsheet, Arc::new(CsvConverter));
        registry
    }

    /// Register (or replace) the converter for `method`.
    pub fn register(
        &mut self,
        method: ConversionMethod,
        converter: Arc<dyn Converter>,
    ) -> &mut Self {
        self.converters.insert(method, converter);
        self
    }

    pub fn get(&self, method: ConversionMethod) -> Option<Arc<dyn Converter>> {
        self.converters.get(&method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = ConversionMethod> + '_ {
        self.converters.keys().copied()
    }
}

/// Read a whole file as UTF-8 within the attempt's time budget.
pub(crate) async fn read_to_string_within(
    request: &ConversionRequest,
) -> Result<String, ConversionError> {
    match tokio::time::timeout(request.timeout, tokio::fs::read_to_string(&request.file_path)).await
    {
        Ok(result) => result.map_err(ConversionError::Io),
        Err(_) => Err(ConversionError::Timeout {
            secs: request.timeout.as_secs(),
        }),
    }
}
