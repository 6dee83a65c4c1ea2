//! CSV to Markdown table conversion.

use async_trait::async_trait;
use serde_json::Value;

use super::{ConversionRequest, Converter, read_to_string_within};
use crate::error::ConversionError;
use crate::task::{ConversionOutput, FileType, Metadata};

/// Renders comma-separated files as a Markdown table.
///
/// Binary spreadsheet formats need an external converter.
pub struct CsvConverter;

#[async_trait]
impl Converter for CsvConverter {
    async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutput, ConversionError> {
        if request.file_type != FileType::Csv {
            return Err(ConversionError::failed(format!(
                "{} files need an external spreadsheet converter",
                request.file_type
            )));
        }

        let raw = read_to_string_within(&request).await?;
        let rows: Vec<Vec<String>> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(split_record)
            .collect();
        request.progress.report(50, "Rows parsed").await;

        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        let content = render_table(&rows, columns);

        let mut metadata = Metadata::new();
        metadata.insert("rows".into(), Value::from(rows.len().saturating_sub(1)));
        metadata.insert("columns".into(), Value::from(columns));

        Ok(ConversionOutput { content, metadata })
    }
}

/// Split one CSV record, honouring double-quoted fields and `""` escapes.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

fn render_table(rows: &[Vec<String>], columns: usize) -> String {
    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };

    let render_row = |row: &Vec<String>| {
        let cells: Vec<String> = (0..columns)
            .map(|i| {
                row.get(i)
                    .map(|cell| cell.trim().replace('|', "\\|"))
                    .unwrap_or_default()
            })
            .collect();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render_row(header));
    lines.push(format!("|{}", " --- |".repeat(columns)));
    lines.extend(body.iter().map(render_row));
    lines.join("\n")
}
