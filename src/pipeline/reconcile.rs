//! Merges the two stage outputs into one canonical attribute list.
//!
//! Stage 2 (catalog-aligned) is the primary source. Stage 1 (free-form, with
//! its `rawText`) is only mined when stage 2 yielded no attribute entries.
//! Everything here is pure: no I/O, no logging.

use super::extract::RAW_TEXT_KEY;
use crate::config::ReconcileConfig;
use crate::models::{
    AttributeDefinition, AttributePriority, AttributeType, AttributeValue, CanonicalAttribute,
    StageKind,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Top-level keys of a free-form object that describe the item rather than
/// one of its attributes.
const RESERVED_KEYS: &[&str] = &[
    RAW_TEXT_KEY,
    "attributes",
    "characteristics",
    "title",
    "name",
    "description",
    "summary",
    "notes",
    "category",
    "confidence",
];

static RAW_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:[-*•][ \t]+)?(?P<name>[^:\n]{1,80}?)[ \t]*(?::|[ \t][-–—][ \t])[ \t]*(?P<value>[^\n]*?)[ \t]*$",
    )
    .expect("raw line pattern compiles")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RawAttribute {
    pub id: Option<i64>,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Id,
    Name,
    Tokens(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeMatch {
    pub id: i64,
    /// Position of the definition in the catalog slice.
    pub index: usize,
    pub kind: MatchKind,
}

/// Lower-case, `_` as space, trimmed, internal whitespace collapsed.
pub fn normalize_name(raw: &str) -> String {
    raw.replace('_', " ")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whitespace-delimited tokens of the normalized name. Punctuation at the
/// edges of a token is dropped, inner punctuation (`wi-fi`) is kept.
fn name_tokens(raw: &str) -> HashSet<String> {
    normalize_name(raw)
        .split_whitespace()
        .map(|t| t.trim_matches(|ch: char| !ch.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolves a raw attribute to a catalog entry: exact id, then normalized
/// name, then the best token overlap with at least `min(2, raw tokens)`
/// shared tokens. Ties keep the earlier catalog entry.
pub fn match_attribute(
    raw_id: Option<i64>,
    raw_name: &str,
    catalog: &[AttributeDefinition],
) -> Option<AttributeMatch> {
    if let Some(id) = raw_id.filter(|id| *id != 0)
        && let Some(index) = catalog.iter().position(|def| def.id == id)
    {
        return Some(AttributeMatch {
            id,
            index,
            kind: MatchKind::Id,
        });
    }

    let normalized = normalize_name(raw_name);
    if normalized.is_empty() {
        return None;
    }
    if let Some(index) = catalog
        .iter()
        .position(|def| normalize_name(&def.name) == normalized)
    {
        return Some(AttributeMatch {
            id: catalog[index].id,
            index,
            kind: MatchKind::Name,
        });
    }

    let raw_tokens = name_tokens(raw_name);
    let required = raw_tokens.len().min(2);
    let mut best: Option<(usize, usize)> = None;
    for (index, def) in catalog.iter().enumerate() {
        let shared = name_tokens(&def.name).intersection(&raw_tokens).count();
        if shared > best.map(|(_, count)| count).unwrap_or(0) {
            best = Some((index, shared));
        }
    }
    best.filter(|(_, shared)| *shared >= required)
        .map(|(index, shared)| AttributeMatch {
            id: catalog[index].id,
            index,
            kind: MatchKind::Tokens(shared),
        })
}

/// Digits, decimal separators and minus survive; a comma becomes a dot.
pub fn coerce_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ',' | '-'))
        .map(|ch| if ch == ',' { '.' } else { ch })
        .collect();
    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(scalar_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(map) => map.get("value").and_then(scalar_text),
        Value::Null => None,
    }
}

fn coerce_value(value: &Value, kind: Option<AttributeType>) -> AttributeValue {
    match (kind, value) {
        (_, Value::Number(number)) => number
            .as_f64()
            .map(AttributeValue::Number)
            .unwrap_or(AttributeValue::Null),
        (Some(AttributeType::Number), other) => match scalar_text(other) {
            Some(text) => coerce_number(&text)
                .map(AttributeValue::Number)
                .unwrap_or(AttributeValue::Null),
            None => AttributeValue::Null,
        },
        (_, Value::Array(items)) if items.len() == 1 => coerce_value(&items[0], kind),
        (_, other) => scalar_text(other)
            .map(AttributeValue::Text)
            .unwrap_or(AttributeValue::Null),
    }
}

fn raw_id(entry: &Map<String, Value>) -> Option<i64> {
    ["id", "attribute_id", "attributeId"]
        .iter()
        .filter_map(|key| entry.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        })
}

fn raw_name(entry: &Map<String, Value>) -> Option<String> {
    ["name", "attribute_name", "attributeName", "attribute", "key"]
        .iter()
        .filter_map(|key| entry.get(*key).and_then(Value::as_str))
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

fn raw_value(entry: &Map<String, Value>) -> Value {
    ["value", "values", "val"]
        .iter()
        .find_map(|key| entry.get(*key).cloned())
        .unwrap_or(Value::Null)
}

/// Reads an explicit attribute list (`attributes` or `characteristics`),
/// either as an array of `{id, name, value}` entries or as a name→value map.
pub fn structured_entries(object: &Map<String, Value>) -> Vec<RawAttribute> {
    let Some(list) = ["attributes", "characteristics"]
        .iter()
        .find_map(|key| object.get(*key))
    else {
        return Vec::new();
    };
    match list {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|entry| {
                let id = raw_id(entry);
                let name = raw_name(entry);
                if id.is_none() && name.is_none() {
                    return None;
                }
                Some(RawAttribute {
                    id,
                    name: name.unwrap_or_default(),
                    value: raw_value(entry),
                })
            })
            .collect(),
        Value::Object(map) => pairs(map),
        _ => Vec::new(),
    }
}

fn pairs(map: &Map<String, Value>) -> Vec<RawAttribute> {
    map.iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| RawAttribute {
            id: None,
            name: name.trim().to_string(),
            value: value.clone(),
        })
        .collect()
}

/// Mines a free-form object: explicit list, then top-level pairs (nested
/// objects flattened one level), then `name: value` lines in `rawText`.
pub fn freeform_entries(object: &Map<String, Value>) -> Vec<RawAttribute> {
    let mut entries = structured_entries(object);
    for (key, value) in object {
        if RESERVED_KEYS.iter().any(|reserved| key.eq_ignore_ascii_case(reserved)) {
            continue;
        }
        match value {
            Value::Object(nested) => entries.extend(pairs(nested)),
            _ => entries.extend(pairs(&Map::from_iter([(key.clone(), value.clone())]))),
        }
    }
    if let Some(text) = object.get(RAW_TEXT_KEY).and_then(Value::as_str) {
        entries.extend(raw_text_entries(text));
    }
    entries
}

pub fn raw_text_entries(text: &str) -> Vec<RawAttribute> {
    RAW_LINE
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.name("name")?.as_str().trim().trim_matches('"');
            let value = caps
                .name("value")?
                .as_str()
                .trim()
                .trim_end_matches([',', ';'])
                .trim_matches('"');
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some(RawAttribute {
                id: None,
                name: name.to_string(),
                value: Value::String(value.to_string()),
            })
        })
        .collect()
}

pub fn reconcile(
    stage1: &Map<String, Value>,
    stage2: &Map<String, Value>,
    catalog: &[AttributeDefinition],
    config: &ReconcileConfig,
) -> Vec<CanonicalAttribute> {
    let aligned = structured_entries(stage2);
    let (entries, source, confidence) = if aligned.is_empty() {
        (
            freeform_entries(stage1),
            StageKind::ExtractAttributes,
            config.freeform_confidence,
        )
    } else {
        (aligned, StageKind::AlignCatalog, config.catalog_confidence)
    };

    let mut resolved: Vec<CanonicalAttribute> = Vec::new();
    let mut unresolved: Vec<CanonicalAttribute> = Vec::new();
    let mut by_id: HashMap<i64, usize> = HashMap::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        match match_attribute(entry.id, &entry.name, catalog) {
            Some(found) => {
                let def = &catalog[found.index];
                let candidate = CanonicalAttribute {
                    id: def.id,
                    name: def.name.clone(),
                    value: coerce_value(&entry.value, Some(def.kind)),
                    confidence,
                    source_stage: source,
                    detected_type: def.kind,
                    priority: AttributePriority::Primary,
                };
                upsert(&mut resolved, &mut by_id, def.id, candidate);
            }
            None => {
                let name = match (entry.name.trim().is_empty(), entry.id) {
                    (false, _) => entry.name.trim().to_string(),
                    (true, Some(id)) => format!("attribute_{id}"),
                    (true, None) => continue,
                };
                let key = normalize_name(&name);
                let value = coerce_value(&entry.value, None);
                let detected_type = match value {
                    AttributeValue::Number(_) => AttributeType::Number,
                    _ => AttributeType::String,
                };
                let candidate = CanonicalAttribute {
                    id: 0,
                    name,
                    value,
                    confidence,
                    source_stage: source,
                    detected_type,
                    priority: AttributePriority::Low,
                };
                upsert(&mut unresolved, &mut by_name, key, candidate);
            }
        }
    }

    resolved.extend(unresolved);
    resolved
}

/// First non-null value wins; a later value only replaces an empty one.
fn upsert<K: std::hash::Hash + Eq>(
    list: &mut Vec<CanonicalAttribute>,
    index: &mut HashMap<K, usize>,
    key: K,
    candidate: CanonicalAttribute,
) {
    match index.get(&key) {
        Some(&pos) => {
            if list[pos].value.is_null() && !candidate.value.is_null() {
                list[pos] = candidate;
            }
        }
        None => {
            index.insert(key, list.len());
            list.push(candidate);
        }
    }
}
