//! Best-effort conversion of stage output into a JSON object.
//!
//! This is the only place untyped model output becomes structured data.
//! Extraction never fails: text that cannot be parsed is preserved under
//! [`RAW_TEXT_KEY`] so the next stage can mine it.

use serde_json::{Map, Value};

pub const RAW_TEXT_KEY: &str = "rawText";

/// What a stage handed back after envelope unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    Structured(Map<String, Value>),
    RawText(String),
}

impl StagePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            StagePayload::Structured(_) => "structured",
            StagePayload::RawText(_) => "raw_text",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub fields: Map<String, Value>,
    /// False when the fields are only the raw-text fallback container.
    pub parsed: bool,
}

impl Extracted {
    pub fn raw_text(&self) -> Option<&str> {
        self.fields.get(RAW_TEXT_KEY).and_then(Value::as_str)
    }

    /// Fallback used when a stage produced nothing usable at all.
    pub fn fallback(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            parsed: false,
        }
    }
}

pub fn extract(payload: &StagePayload) -> Extracted {
    match payload {
        StagePayload::Structured(map) => Extracted {
            fields: map.clone(),
            parsed: true,
        },
        StagePayload::RawText(text) => match parse_text(text) {
            Some(fields) => Extracted {
                fields,
                parsed: true,
            },
            None => {
                let mut fields = Map::new();
                fields.insert(RAW_TEXT_KEY.into(), Value::String(text.clone()));
                Extracted {
                    fields,
                    parsed: false,
                }
            }
        },
    }
}

fn parse_text(text: &str) -> Option<Map<String, Value>> {
    let cleaned = strip_markdown_fence(text);
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&cleaned) {
        return Some(map);
    }
    embedded_objects(text).find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    })
}

pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Yields every balanced `{...}` span in order of its opening brace.
/// Braces inside JSON string literals do not count. One pass over the text;
/// quotes outside any open brace are prose and ignored.
fn embedded_objects(text: &str) -> impl Iterator<Item = &str> {
    let mut open = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if !open.is_empty() => in_string = true,
            '{' => open.push(idx),
            '}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, idx + ch.len_utf8()));
                }
            }
            _ => {}
        }
    }
    spans.sort_unstable_by_key(|(start, _)| *start);
    spans.into_iter().map(move |(start, end)| &text[start..end])
}
