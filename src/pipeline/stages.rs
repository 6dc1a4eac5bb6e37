//! Prompt construction for the two inference stages and selection of the
//! generated title/description.

use super::extract::Extracted;
use crate::llm::{InferenceRequest, LlmMessage};
use crate::models::{AttributeDefinition, AttributeType, StageKind, Subject};
use serde_json::{Map, Value, json};

const EXTRACT_SYSTEM_PROMPT: &str = "You extract product attributes from a seller's item description. \
Reply with a single JSON object mapping attribute names to values. Use the language of the input. \
Do not invent values that the text does not support.";

const ALIGN_SYSTEM_PROMPT: &str = "You map product attributes onto a marketplace catalog and write the item card. \
Reply with a single JSON object: {\"title\": string, \"description\": string, \
\"attributes\": [{\"id\": number, \"name\": string, \"value\": string or number}]}. \
Only use attribute ids from the catalog. The title must be at most 60 characters; \
the description should be 1300 to 2000 characters.";

pub fn extract_request(subject: &Subject) -> InferenceRequest {
    let mut prompt = format!("Item name: {}\nCategory: {}", subject.name, subject.category_id);
    if !subject.description.trim().is_empty() {
        prompt.push_str("\nDescription:\n");
        prompt.push_str(subject.description.trim());
    }
    InferenceRequest {
        stage: StageKind::ExtractAttributes,
        messages: vec![LlmMessage::system(EXTRACT_SYSTEM_PROMPT), LlmMessage::user(prompt)],
    }
}

pub fn align_request(
    subject: &Subject,
    stage1: &Extracted,
    catalog: &[AttributeDefinition],
) -> InferenceRequest {
    let extracted = Value::Object(stage1.fields.clone());
    let prompt = format!(
        "Item name: {}\nCategory: {}\n\nExtracted attributes:\n{}\n\nCatalog attributes:\n{}",
        subject.name,
        subject.category_id,
        serde_json::to_string_pretty(&extracted).unwrap_or_else(|_| extracted.to_string()),
        render_catalog(catalog),
    );
    InferenceRequest {
        stage: StageKind::AlignCatalog,
        messages: vec![LlmMessage::system(ALIGN_SYSTEM_PROMPT), LlmMessage::user(prompt)],
    }
}

/// One line per definition: `id | name | type | required | allowed values`.
pub fn render_catalog(catalog: &[AttributeDefinition]) -> String {
    catalog
        .iter()
        .map(|def| {
            let kind = match def.kind {
                AttributeType::String => "string",
                AttributeType::Number => "number",
            };
            let mut line = format!("{} | {} | {}", def.id, def.name, kind);
            if def.required {
                line.push_str(" | required");
            }
            if !def.allowed_values.is_empty() {
                line.push_str(" | one of: ");
                line.push_str(&def.allowed_values.join(", "));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stage 1 stand-in when extraction failed outright.
pub fn stage_one_fallback(subject: &Subject) -> Map<String, Value> {
    match json!({ "name": subject.name }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// Stage 2 title, else stage 1, else the subject name; cut to `max_chars`.
pub fn pick_title(stage2: &Extracted, stage1: &Extracted, subject: &Subject, max_chars: usize) -> String {
    let title = text_field(&stage2.fields, &["title"])
        .or_else(|| text_field(&stage1.fields, &["title", "name"]))
        .unwrap_or_else(|| subject.name.trim().to_string());
    truncate_chars(&title, max_chars)
}

pub fn pick_description(stage2: &Extracted, stage1: &Extracted, subject: &Subject) -> String {
    text_field(&stage2.fields, &["description"])
        .or_else(|| text_field(&stage1.fields, &["description"]))
        .unwrap_or_else(|| subject.description.trim().to_string())
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    cut.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn subject() -> Subject {
        Subject {
            id: "sku-1".into(),
            name: "Часы Casio MTP-1302".into(),
            description: "Кварцевые часы, стальной корпус".into(),
            category_id: "watches".into(),
            created_at: Utc::now(),
        }
    }

    fn fields(value: Value) -> Extracted {
        Extracted {
            fields: value.as_object().cloned().unwrap_or_default(),
            parsed: true,
        }
    }

    #[test]
    fn title_falls_back_through_stages() {
        let subject = subject();
        let empty = fields(json!({}));
        let stage1 = fields(json!({"title": "  "}));
        assert_eq!(pick_title(&empty, &stage1, &subject, 60), "Часы Casio MTP-1302");

        let stage1 = fields(json!({"name": "Casio MTP"}));
        assert_eq!(pick_title(&empty, &stage1, &subject, 60), "Casio MTP");

        let stage2 = fields(json!({"title": "Наручные часы Casio"}));
        assert_eq!(pick_title(&stage2, &stage1, &subject, 60), "Наручные часы Casio");
    }

    #[test]
    fn title_is_cut_on_char_boundary() {
        let subject = subject();
        let stage2 = fields(json!({"title": "Часы наручные мужские"}));
        assert_eq!(pick_title(&stage2, &fields(json!({})), &subject, 5), "Часы");
    }

    #[test]
    fn description_prefers_generated_text() {
        let subject = subject();
        let stage2 = fields(json!({"description": "Сгенерированное описание"}));
        let empty = fields(json!({}));
        assert_eq!(pick_description(&stage2, &empty, &subject), "Сгенерированное описание");
        assert_eq!(pick_description(&empty, &empty, &subject), subject.description);
    }

    #[test]
    fn align_prompt_lists_catalog_and_stage_one_output() {
        let catalog = vec![AttributeDefinition {
            id: 10096,
            name: "Цвет товара".into(),
            kind: AttributeType::String,
            required: true,
            allowed_values: vec!["черный".into(), "белый".into()],
        }];
        let stage1 = fields(json!({"rawText": "Цвет: черный"}));
        let request = align_request(&subject(), &stage1, &catalog);
        assert_eq!(request.stage, StageKind::AlignCatalog);
        let user = &request.messages[1].content;
        assert!(user.contains("10096 | Цвет товара | string | required | one of: черный, белый"));
        assert!(user.contains("Цвет: черный"));
    }

    #[test]
    fn fallback_carries_only_the_name() {
        let map = stage_one_fallback(&subject());
        assert_eq!(map.len(), 1);
        assert_eq!(map["name"], json!("Часы Casio MTP-1302"));
    }
}
