use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change delivered on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType", alias = "type")]
    pub kind: ChangeKind,
    #[serde(default, rename = "new", alias = "record")]
    pub new: Option<Value>,
    #[serde(default, rename = "old", alias = "old_record")]
    pub old: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            kind,
            new: None,
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self { new: Some(row), ..Self::new(table, ChangeKind::Insert) }
    }

    pub fn update(table: impl Into<String>, old: Value, new: Value) -> Self {
        Self { old: Some(old), new: Some(new), ..Self::new(table, ChangeKind::Update) }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self { old: Some(old), ..Self::new(table, ChangeKind::Delete) }
    }

    /// The row the change is about: the new image, or the old one for deletes.
    pub fn row(&self) -> Option<&Value> {
        self.new
            .as_ref()
            .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .or(self.old.as_ref())
    }

    pub fn committed_at(&self) -> Option<OffsetDateTime> {
        self.commit_timestamp
            .as_deref()
            .and_then(|ts| OffsetDateTime::parse(ts, &Rfc3339).ok())
    }
}
