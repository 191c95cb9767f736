use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One addressable remote environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Identity of one synchronizable remote field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef {
    pub instance: Instance,
    pub table_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub field_name: String,
    #[serde(rename = "sys_id")]
    pub sys_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(flatten)]
    pub record: RecordRef,
    #[serde(alias = "filename")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "last_update", default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    #[serde(rename = "last_updated_by", default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreContents {
    #[serde(default)]
    pub files: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// A local file resolved to the remote field it mirrors, with its current text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    #[serde(flatten)]
    pub record: RecordRef,
    pub file_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OpenFileState {
    pub opened: DateTime<Utc>,
    pub refreshed: DateTime<Utc>,
    pub sys_updated_on: String,
    pub sys_updated_by: String,
    pub scope: String,
    pub content: Option<String>,
    pub original_content: String,
}

impl OpenFileState {
    pub fn new(original_content: String) -> Self {
        let now = Utc::now();
        Self {
            opened: now,
            refreshed: now,
            sys_updated_on: String::new(),
            sys_updated_by: String::new(),
            scope: String::new(),
            content: None,
            original_content,
        }
    }
}

/// Parameters of the open-record command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRecordRequest {
    pub instance: Instance,
    pub table_name: String,
    pub field_name: String,
    pub name: String,
    #[serde(rename = "sys_id")]
    pub sys_id: String,
    pub extension: String,
}
