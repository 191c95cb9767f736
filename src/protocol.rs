use crate::errors::{AppError, AppResult};
use crate::models::{FileMetadata, Instance, RecordPayload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const GREETING: &str = r#"["Connected to ScriptSync WebSocket"]"#;
pub const MAX_CONNECTION_REASON: &str = "max connection";
pub const NO_CHANNEL_WARNING: &str =
    "No WebSocket connection. Please open the ScriptSync helper tab in a browser";
const ACL_WARNING: &str = "ACL Error, try changing scope in the browser";
const TOKEN_WARNING: &str =
    "Could not sync file, no valid token. Try typing the slashcommand /token in a active browser session and retry.";
pub const UPDATE_METADATA_FIELDS: &str = "name,sys_updated_on,sys_updated_by,sys_scope.scope";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionGoal {
    UpdateCheck,
    GetCurrent,
    GetMetadata,
    SaveCheck,
}

// ─── Inbound (browser agent → local) ────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    RemoteError(RemoteError),
    AppMeta(Value),
    WriteInstanceSettings(Instance),
    UpdateCheck(FieldResult),
    GetCurrent(FieldResult),
    GetMetadata(MetadataResult),
    SaveResponse(SaveResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub detail: String,
}

impl RemoteError {
    /// Warning text shown to the user, with known causes rewritten.
    pub fn warning(&self) -> String {
        let detail = if self.detail.contains("ACL") {
            ACL_WARNING
        } else if self.detail.contains("Required to provide Auth information") {
            TOKEN_WARNING
        } else {
            self.detail.as_str()
        };
        format!("Error while saving file: {detail}")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldResult {
    pub file_name: String,
    pub field_name: String,
    #[serde(default)]
    pub result: Map<String, Value>,
}

impl FieldResult {
    pub fn result_str(&self, key: &str) -> Option<&str> {
        self.result.get(key).and_then(Value::as_str)
    }

    pub fn field_content(&self) -> Option<&str> {
        self.result_str(&self.field_name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResult {
    pub meta: MetadataRef,
    #[serde(default)]
    pub result: UpdateStamp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRef {
    #[serde(alias = "filename")]
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdateStamp {
    #[serde(default)]
    pub sys_updated_on: Option<String>,
    #[serde(default)]
    pub sys_updated_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedField {
    pub name: String,
    pub file_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    #[serde(default)]
    pub instance: Option<Instance>,
    #[serde(default)]
    pub file_path: Option<String>,
    pub table_name: String,
    #[serde(default = "default_display_field")]
    pub display_value_field: String,
    #[serde(default)]
    pub fields: Vec<RequestedField>,
    pub results: Vec<Map<String, Value>>,
}

fn default_display_field() -> String {
    "name".to_string()
}

impl InboundMessage {
    pub fn decode(text: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Classifies a message by its discriminators, in priority order:
    /// `error`, `action`, `actionGoal`, then the presence of `results`.
    pub fn from_value(value: Value) -> AppResult<Self> {
        let Some(object) = value.as_object() else {
            return Err(AppError::MalformedMessage("message is not a JSON object".to_string()));
        };
        let error = object.get("error").cloned();
        let action = object.get("action").and_then(Value::as_str).map(str::to_string);
        let goal = object.get("actionGoal").and_then(Value::as_str).map(str::to_string);
        let instance = object.get("instance").cloned();
        let has_results = object.contains_key("results");

        if let Some(error) = error {
            let detail = match error {
                Value::String(text) => text,
                other => other
                    .get("detail")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            return Ok(Self::RemoteError(RemoteError { detail }));
        }

        match action.as_deref() {
            Some("requestAppMeta") => return Ok(Self::AppMeta(value)),
            Some("writeInstanceSettings") => {
                let instance = instance.ok_or_else(|| {
                    AppError::MalformedMessage("instance settings without instance".to_string())
                })?;
                return Ok(Self::WriteInstanceSettings(typed(instance)?));
            }
            _ => {}
        }

        match goal.as_deref() {
            Some("updateCheck") => return Ok(Self::UpdateCheck(typed(value)?)),
            Some("getCurrent") => return Ok(Self::GetCurrent(typed(value)?)),
            Some("getMetadata") => return Ok(Self::GetMetadata(typed(value)?)),
            _ => {}
        }

        if has_results {
            return Ok(Self::SaveResponse(typed(value)?));
        }
        Err(AppError::MalformedMessage(
            "response does not carry results".to_string(),
        ))
    }
}

fn typed<T: DeserializeOwned>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(AppError::from)
}

// ─── Request endpoint (browser agent → local, over HTTP) ────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    SaveFieldAsFile(SaveFieldRequest),
    SaveWidget(Value),
    LinkApp(LinkAppRequest),
    RequestedRecords(Value),
    WriteInstanceSettings(Instance),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveFieldRequest {
    pub name: String,
    pub table: String,
    pub field: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(rename = "sys_id")]
    pub sys_id: String,
    pub instance: Instance,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mirrorbgscript: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkAppRequest {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub app_scope: Option<String>,
    pub instance: Instance,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestMessage {
    pub fn decode(body: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(body)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> AppResult<Self> {
        if !value.is_object() {
            return Err(AppError::MalformedMessage("request is not a JSON object".to_string()));
        }
        let action = value.get("action").and_then(Value::as_str).map(str::to_string);
        match action.as_deref() {
            Some("saveFieldAsFile") => Ok(Self::SaveFieldAsFile(typed(value)?)),
            Some("saveWidget") => Ok(Self::SaveWidget(value)),
            Some("linkAppToVSCode") => Ok(Self::LinkApp(typed(value)?)),
            Some("requestedRecords") => Ok(Self::RequestedRecords(value)),
            Some("writeInstanceSettings") | None => {
                let instance = value
                    .get("instance")
                    .cloned()
                    .ok_or_else(|| AppError::MalformedMessage("request without instance".to_string()))?;
                Ok(Self::WriteInstanceSettings(typed(instance)?))
            }
            Some(other) => Err(AppError::MalformedMessage(format!("unknown request action `{other}`"))),
        }
    }
}

// ─── Outbound (local → browser agent) ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecordMessage {
    pub action: &'static str,
    pub action_goal: ActionGoal,
    pub instance: Instance,
    pub table_name: String,
    #[serde(rename = "sys_id")]
    pub sys_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<FileMetadata>,
}

impl RequestRecordMessage {
    pub fn new(goal: ActionGoal, instance: Instance, table_name: String, sys_id: String) -> Self {
        Self {
            action: "requestRecord",
            action_goal: goal,
            instance,
            table_name,
            sys_id,
            field_name: None,
            file_name: None,
            name: None,
            meta: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecordsMessage {
    pub action: &'static str,
    pub action_goal: ActionGoal,
    pub instance: Instance,
    pub file_path: String,
    pub table_name: String,
    pub display_value_field: String,
    pub fields: Vec<RequestedField>,
    pub query_string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAppMetaMessage {
    pub action: &'static str,
    pub action_goal: ActionGoal,
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub app_scope: Option<String>,
    pub instance: Instance,
}

impl From<&LinkAppRequest> for RequestAppMetaMessage {
    fn from(request: &LinkAppRequest) -> Self {
        Self {
            action: "requestAppMeta",
            action_goal: ActionGoal::SaveCheck,
            app_id: request.app_id.clone(),
            app_name: request.app_name.clone(),
            app_scope: request.app_scope.clone(),
            instance: request.instance.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdateMessage {
    pub liveupdate: bool,
    #[serde(rename = "sys_id")]
    pub sys_id: String,
    pub css: String,
    pub test_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorMessage {
    #[serde(flatten)]
    pub payload: RecordPayload,
    pub mirrorbgscript: bool,
}
