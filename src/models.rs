use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Creating,
    Analyzing,
    Publishing,
    Completed,
    Error,
}

impl TaskStatus {
    /// Statuses a restarted process has to pick back up.
    pub const RESUMABLE: [TaskStatus; 3] = [
        TaskStatus::Creating,
        TaskStatus::Analyzing,
        TaskStatus::Publishing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Creating => "CREATING",
            TaskStatus::Analyzing => "ANALYZING",
            TaskStatus::Publishing => "PUBLISHING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    /// Position in the forward lifecycle. ERROR sits outside the order.
    pub fn rank(&self) -> Option<u8> {
        match self {
            TaskStatus::Creating => Some(0),
            TaskStatus::Analyzing => Some(1),
            TaskStatus::Publishing => Some(2),
            TaskStatus::Completed => Some(3),
            TaskStatus::Error => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub subject_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub stage_label: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(subject_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            status: TaskStatus::Creating,
            progress: 0,
            stage_label: "Queued".into(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Partial update for a stored task. `None` leaves the field untouched.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub stage_label: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn apply(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(label) = &self.stage_label {
            record.stage_label = label.clone();
        }
        if let Some(message) = &self.error_message {
            record.error_message = Some(message.clone());
        }
        if let Some(updated_at) = self.updated_at {
            record.updated_at = updated_at;
        }
        if let Some(completed_at) = self.completed_at {
            record.completed_at = Some(completed_at);
        }
    }
}

/// The item being analyzed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemSubmission {
    #[serde(default)]
    pub subject_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeDefinition {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub allowed_values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Free-form attribute extraction from the item text.
    ExtractAttributes,
    /// Catalog-aligned attributes plus generated title and description.
    AlignCatalog,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ExtractAttributes => "extract_attributes",
            StageKind::AlignCatalog => "align_catalog",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
    Null,
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributePriority {
    Primary,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalAttribute {
    /// Catalog id, 0 when the raw name could not be resolved.
    pub id: i64,
    pub name: String,
    pub value: AttributeValue,
    pub confidence: f32,
    pub source_stage: StageKind,
    pub detected_type: AttributeType,
    pub priority: AttributePriority,
}

impl CanonicalAttribute {
    pub fn is_resolved(&self) -> bool {
        self.id != 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ScoreBreakdown {
    pub fill: f64,
    pub description: f64,
    pub title: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityMetrics {
    pub fill_rate: u8,
    pub title_length: usize,
    pub description_length: usize,
    pub overall_score: u8,
    pub acceptable: bool,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub task_id: Uuid,
    pub subject_id: String,
    pub title: String,
    pub description: String,
    pub attributes: Vec<CanonicalAttribute>,
    pub quality: QualityMetrics,
    pub stage1_parsed: bool,
    pub stage2_parsed: bool,
    #[serde(default)]
    pub degraded_stages: Vec<StageKind>,
    pub stages: Vec<StageReport>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_screaming_case() {
        let value = serde_json::to_value(TaskStatus::Publishing).unwrap();
        assert_eq!(value, json!("PUBLISHING"));
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Creating.is_terminal());
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let now = Utc::now();
        let mut record = TaskRecord::new("item-1", now);
        let patch = TaskPatch {
            progress: Some(40),
            stage_label: Some("Attributes extracted".into()),
            ..Default::default()
        };
        patch.apply(&mut record);
        assert_eq!(record.progress, 40);
        assert_eq!(record.status, TaskStatus::Creating);
        assert_eq!(record.stage_label, "Attributes extracted");
        assert!(record.error_message.is_none());
    }

    #[test]
    fn attribute_value_is_untagged() {
        assert_eq!(
            serde_json::to_value(AttributeValue::Number(2.1)).unwrap(),
            json!(2.1)
        );
        assert_eq!(
            serde_json::to_value(AttributeValue::Text("red".into())).unwrap(),
            json!("red")
        );
        assert_eq!(serde_json::to_value(AttributeValue::Null).unwrap(), json!(null));
    }

    #[test]
    fn definition_reads_type_field() {
        let def: AttributeDefinition = serde_json::from_value(json!({
            "id": 85,
            "name": "Бренд",
            "type": "string",
        }))
        .unwrap();
        assert_eq!(def.kind, AttributeType::String);
        assert!(def.allowed_values.is_empty());
        assert!(!def.required);
    }
}
