mod recover;

pub use recover::{recover_json, FencedJsonBlock, JsonTier, OuterBraces, WholeText};

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info};

use crate::upstream::{RetryingUpstreamClient, UpstreamError};

/// Pinned output schema for tabular export requests. The model is told to
/// answer with raw JSON; recovery handles the cases where it doesn't listen.
const SYSTEM_INSTRUCTION: &str = "You are a data extraction engine. \
Convert the user's request into spreadsheet data and respond with a single JSON object, \
no markdown, no commentary, exactly this shape:\n\
{\"filename\": \"<suggested file name>\", \"sheets\": [{\"name\": \"<sheet name>\", \
\"headers\": [\"<column>\", ...], \"rows\": [[<cell>, ...], ...]}]}\n\
Rows contain scalar values only. Return raw JSON with nothing around it.";

const XLSX_EXT: &str = ".xlsx";

/// An inbound image forwarded to the vision model. Pass-through only; the
/// blob is never persisted.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// One sheet of a tabular export. Rows are passed through unvalidated —
/// their lengths need not match the header count and the workbook writer
/// must tolerate ragged data.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetData {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Validated record set recovered from a model completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub filename: String,
    pub sheets: Vec<SheetData>,
}

/// No usable JSON object could be located or parsed in the completion.
#[derive(Debug, Clone)]
pub struct SchemaError {
    pub detail: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema recovery failed: {}", self.detail)
    }
}

impl std::error::Error for SchemaError {}

#[derive(Debug)]
pub enum ExtractError {
    Upstream(UpstreamError),
    Schema(SchemaError),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Upstream(e) => e.fmt(f),
            ExtractError::Schema(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Turns a natural-language request into a validated record set by asking
/// the model for a pinned JSON schema and recovering that JSON from however
/// the model chose to wrap it.
pub struct StructuredExtractor {
    client: Arc<RetryingUpstreamClient>,
    chat_model: String,
    vision_model: String,
}

impl StructuredExtractor {
    pub fn new(
        client: Arc<RetryingUpstreamClient>,
        chat_model: impl Into<String>,
        vision_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            chat_model: chat_model.into(),
            vision_model: vision_model.into(),
        }
    }

    pub async fn extract(
        &self,
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<ExtractionResult, ExtractError> {
        let user_content = match image {
            None => json!(prompt),
            Some(img) => json!([
                {"type": "text", "text": prompt},
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", img.media_type, img.data),
                    },
                },
            ]),
        };
        let messages = vec![
            json!({"role": "system", "content": SYSTEM_INSTRUCTION}),
            json!({"role": "user", "content": user_content}),
        ];

        let model = if image.is_some() {
            &self.vision_model
        } else {
            &self.chat_model
        };

        let completion = self
            .client
            .complete(model, &messages)
            .await
            .map_err(ExtractError::Upstream)?;

        match recover_json(&completion) {
            // Only an object fits the pinned schema; a bare number, bool or
            // array that happens to parse is still a recovery failure.
            Some(value) if value.is_object() => {
                let result = result_from_value(value);
                info!(
                    filename = %result.filename,
                    sheets = result.sheets.len(),
                    "Extraction recovered"
                );
                Ok(result)
            }
            _ => {
                // Log the raw completion so the failure can be diagnosed.
                error!(
                    completion = %truncate(&completion, 500),
                    "No usable JSON object in extraction completion"
                );
                Err(ExtractError::Schema(SchemaError {
                    detail: "no JSON object in model output".to_string(),
                }))
            }
        }
    }
}

/// Shape a recovered JSON value into an [`ExtractionResult`].
///
/// Absent or empty `sheets` becomes a single placeholder sheet so downstream
/// export never sees a structurally empty document; a filename without the
/// expected extension gets it appended.
fn result_from_value(value: Value) -> ExtractionResult {
    let filename = normalize_filename(value["filename"].as_str().unwrap_or("export"));

    let mut sheets: Vec<SheetData> = value["sheets"]
        .as_array()
        .map(|arr| arr.iter().map(sheet_from_value).collect())
        .unwrap_or_default();

    if sheets.is_empty() {
        sheets.push(SheetData {
            name: "Data".to_string(),
            headers: Vec::new(),
            rows: vec![vec![json!("No data provided")]],
        });
    }

    ExtractionResult { filename, sheets }
}

fn sheet_from_value(value: &Value) -> SheetData {
    let name = value["name"].as_str().unwrap_or("Sheet").to_string();
    let headers = value["headers"]
        .as_array()
        .map(|arr| arr.iter().map(cell_text).collect())
        .unwrap_or_default();
    let rows = value["rows"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|row| row.as_array().cloned())
                .collect()
        })
        .unwrap_or_default();
    SheetData {
        name,
        headers,
        rows,
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize_filename(name: &str) -> String {
    let name = name.trim();
    let name = if name.is_empty() { "export" } else { name };
    if name.to_lowercase().ends_with(XLSX_EXT) {
        name.to_string()
    } else {
        format!("{}{}", name, XLSX_EXT)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    let mut end = text.len().min(max);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
