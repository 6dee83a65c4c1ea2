//! Plain text, Markdown and JSON conversion.

use async_trait::async_trait;
use serde_json::Value;

use super::{ConversionRequest, Converter, read_to_string_within};
use crate::error::ConversionError;
use crate::task::{ConversionOutput, FileType, Metadata};

/// Converter for text-based formats that need no layout extraction
pub struct PlainTextConverter;

#[async_trait]
impl Converter for PlainTextConverter {
    async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutput, ConversionError> {
        let raw = read_to_string_within(&request).await?;
        request.progress.report(50, "File read").await;

        let content = match request.file_type {
            FileType::Markdown | FileType::Text => raw.trim().to_string(),
            FileType::Json => render_json(&raw)?,
            other => {
                return Err(ConversionError::failed(format!(
                    "plain text conversion does not handle {other} files"
                )));
            }
        };

        let title = first_heading(&content).or_else(|| {
            request
                .file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
        });

        let mut metadata = Metadata::new();
        if let Some(title) = title {
            metadata.insert("title".to_string(), Value::String(title));
        }
        metadata.insert("sections".into(), Value::from(count_sections(&content)));
        metadata.insert("char_count".into(), Value::from(content.chars().count()));

        Ok(ConversionOutput { content, metadata })
    }
}

/// Pretty-print JSON inside a fenced code block.
fn render_json(raw: &str) -> Result<String, ConversionError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ConversionError::failed(format!("invalid JSON: {e}")))?;
    let pretty = serde_json::to_string_pretty(&value)
        .map_err(|e| ConversionError::failed(format!("failed to render JSON: {e}")))?;
    Ok(format!("```json\n{pretty}\n```"))
}

/// Text of the first Markdown heading, if any.
fn first_heading(content: &str) -> Option<String> {
    content
        .lines()
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Count header-delimited sections; headerless content is one section.
fn count_sections(content: &str) -> usize {
    if content.trim().is_empty() {
        return 0;
    }
    let headers = content.lines().filter(|l| l.starts_with('#')).count();
    let has_preamble = content
        .lines()
        .take_while(|l| !l.starts_with('#'))
        .any(|l| !l.trim().is_empty());
    headers + usize::from(has_preamble)
}
