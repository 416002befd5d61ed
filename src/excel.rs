//! Workbook rendering for extraction results.
//!
//! Takes the extractor's normalised record set and produces xlsx bytes:
//! one worksheet per sheet, bold header row when headers exist, column
//! widths sized to content and capped at 50 characters. Ragged rows are
//! expected and written as-is.

use rust_xlsxwriter::{Format, Workbook};
use serde_json::Value;
use tracing::debug;

use crate::extract::ExtractionResult;

/// Excel worksheet names are limited to 31 characters.
const MAX_SHEET_NAME: usize = 31;
const MAX_COLUMN_WIDTH: f64 = 50.0;

pub fn build_workbook(result: &ExtractionResult) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let mut used_names: Vec<String> = Vec::new();

    for (index, sheet) in result.sheets.iter().enumerate() {
        let worksheet = workbook.add_worksheet();
        let name = unique_name(sheet_name(&sheet.name, index), &mut used_names);
        worksheet.set_name(name)?;

        // Track the widest cell per column for sizing.
        let mut widths: Vec<usize> = Vec::new();
        let mut row_idx: u32 = 0;

        if !sheet.headers.is_empty() {
            for (col, header) in sheet.headers.iter().enumerate() {
                worksheet.write_string_with_format(row_idx, col as u16, header, &bold)?;
                note_width(&mut widths, col, header.chars().count());
            }
            row_idx += 1;
        }

        for row in &sheet.rows {
            for (col, cell) in row.iter().enumerate() {
                let rendered = write_cell(worksheet, row_idx, col as u16, cell)?;
                note_width(&mut widths, col, rendered);
            }
            row_idx += 1;
        }

        for (col, max_chars) in widths.iter().enumerate() {
            let width = ((*max_chars as f64) + 2.0).min(MAX_COLUMN_WIDTH);
            worksheet.set_column_width(col as u16, width)?;
        }
    }

    let bytes = workbook.save_to_buffer()?;
    debug!(
        sheets = result.sheets.len(),
        bytes = bytes.len(),
        "Workbook rendered"
    );
    Ok(bytes)
}

/// Write one scalar cell; returns its rendered character width.
fn write_cell(
    worksheet: &mut rust_xlsxwriter::Worksheet,
    row: u32,
    col: u16,
    cell: &Value,
) -> anyhow::Result<usize> {
    match cell {
        Value::Null => Ok(0),
        Value::Number(n) => {
            let v = n.as_f64().unwrap_or(0.0);
            worksheet.write_number(row, col, v)?;
            Ok(v.to_string().chars().count())
        }
        Value::Bool(b) => {
            worksheet.write_boolean(row, col, *b)?;
            Ok(5)
        }
        Value::String(s) => {
            worksheet.write_string(row, col, s)?;
            Ok(s.chars().count())
        }
        // Nested structures should not appear in rows, but the model is not
        // trusted to honor that. Flatten to their JSON text.
        other => {
            let s = other.to_string();
            worksheet.write_string(row, col, &s)?;
            Ok(s.chars().count())
        }
    }
}

fn note_width(widths: &mut Vec<usize>, col: usize, chars: usize) {
    if widths.len() <= col {
        widths.resize(col + 1, 0);
    }
    if chars > widths[col] {
        widths[col] = chars;
    }
}

/// Strip characters Excel rejects in sheet names and enforce the length
/// limit; an empty result falls back to a positional name.
fn sheet_name(raw: &str, index: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(MAX_SHEET_NAME)
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        format!("Sheet{}", index + 1)
    } else {
        cleaned
    }
}

/// Worksheet names must be unique within a workbook; number duplicates.
fn unique_name(base: String, used: &mut Vec<String>) -> String {
    if !used.contains(&base) {
        used.push(base.clone());
        return base;
    }
    let mut n = 2;
    loop {
        let suffix = format!(" {}", n);
        let mut candidate: String = base
            .chars()
            .take(MAX_SHEET_NAME.saturating_sub(suffix.len()))
            .collect();
        candidate.push_str(&suffix);
        if !used.contains(&candidate) {
            used.push(candidate.clone());
            return candidate;
        }
        n += 1;
    }
}
