use crate::errors::{AppError, AppResult};
use crate::mapper::{sanitize_name, WidgetField, TEST_URLS_FILE, WIDGET_DESCRIPTOR_FILE};
use crate::models::{FileMetadata, Instance, RecordRef};
use crate::protocol::{ActionGoal, RequestRecordsMessage, RequestedField};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const WIDGET_TABLE: &str = "sp_widget";
const HEADER_FOOTER_TABLE: &str = "sp_header_footer";
const TEMPLATE_TABLE: &str = "sp_ng_template";

#[derive(Debug, Clone, Deserialize)]
struct WidgetPayload {
    name: String,
    #[serde(default)]
    table: Option<String>,
    sys_id: String,
    instance: Instance,
    #[serde(default)]
    widget: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetFileWrite {
    pub file_name: String,
    pub content: String,
    pub field: Option<WidgetField>,
    pub open_file: bool,
}

/// One widget record expanded into its field files and follow-up messages.
#[derive(Debug, Clone)]
pub struct WidgetSplit {
    pub directory: PathBuf,
    pub record: RecordRef,
    pub files: Vec<WidgetFileWrite>,
    pub content_length: usize,
    pub test_urls: Vec<String>,
    pub template_request: RequestRecordsMessage,
    status: Value,
}

impl WidgetSplit {
    pub fn field_files(&self) -> impl Iterator<Item = &WidgetFileWrite> {
        self.files.iter().filter(|file| file.field.is_some())
    }

    /// Store entry for the widget; all field files share the widget's sys_id.
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            record: self.record.clone(),
            file_name: self.directory.join(WIDGET_DESCRIPTOR_FILE).to_string_lossy().to_string(),
            test_urls: self.test_urls.clone(),
            ..FileMetadata::default()
        }
    }

    /// Payload echoed to the agent once the files are written.
    pub fn status_message(&self) -> &Value {
        &self.status
    }
}

pub fn split_widget(root: &Path, payload: Value) -> AppResult<WidgetSplit> {
    let widget: WidgetPayload = serde_json::from_value(payload.clone())?;
    let full = widget.widget.contains_key(WidgetField::OptionSchema.field_name());
    let all = WidgetField::ALL;
    let fields = if full { &all[..] } else { &all[..5] };
    let table = match &widget.table {
        Some(table) => table.clone(),
        None if full => WIDGET_TABLE.to_string(),
        None => HEADER_FOOTER_TABLE.to_string(),
    };

    let mut files = Vec::with_capacity(fields.len() + 1);
    let mut content_length = 0usize;
    for field in fields {
        let content = field_value(&widget.widget, field.field_name());
        content_length += content.len();
        files.push(WidgetFileWrite {
            file_name: field.file_name(),
            content,
            field: Some(*field),
            open_file: field.opens_in_editor(),
        });
    }
    files.push(WidgetFileWrite {
        file_name: WIDGET_DESCRIPTOR_FILE.to_string(),
        content: serde_json::to_string_pretty(&payload)
            .map_err(|error| AppError::Internal(error.to_string()))?,
        field: None,
        open_file: false,
    });

    let directory = root
        .join(&widget.instance.name)
        .join(&table)
        .join(sanitize_name(&widget.name));
    let field_list = fields.iter().map(|field| field.field_name()).collect::<Vec<_>>().join(",");
    let test_urls = preview_urls(&widget);

    let template_request = RequestRecordsMessage {
        action: "requestRecords",
        action_goal: ActionGoal::SaveCheck,
        instance: widget.instance.clone(),
        file_path: directory.to_string_lossy().to_string(),
        table_name: TEMPLATE_TABLE.to_string(),
        display_value_field: "sys_name".to_string(),
        fields: vec![RequestedField {
            name: "template".to_string(),
            file_type: "html".to_string(),
        }],
        query_string: format!("sysparm_query=sp_widget={}", widget.sys_id),
    };

    let mut status = payload;
    if let Some(object) = status.as_object_mut() {
        object.insert("widget".to_string(), json!({}));
        object.insert("result".to_string(), json!({}));
        object.insert("content".to_string(), json!({ "length": content_length }));
        object.insert("fieldName".to_string(), json!(field_list));
    }

    Ok(WidgetSplit {
        record: RecordRef {
            instance: widget.instance,
            table_name: table,
            name: sanitize_name(&widget.name),
            field_name: field_list,
            sys_id: widget.sys_id,
        },
        directory,
        files,
        content_length,
        test_urls,
        template_request,
        status,
    })
}

fn field_value(widget: &Map<String, Value>, field: &str) -> String {
    match widget.get(field) {
        Some(Value::Object(object)) => match object.get("value") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    }
}

fn preview_urls(widget: &WidgetPayload) -> Vec<String> {
    let base = widget.instance.url.trim_end_matches('/');
    let page_id = widget
        .widget
        .get("id")
        .and_then(|id| id.get("displayValue"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    vec![
        format!("{base}/$sp.do?id=sp-preview&sys_id={}", widget.sys_id),
        format!("{base}/sp_config?id={page_id}"),
        format!("{base}/sp?id={page_id}"),
    ]
}

/// Writes `test_urls.txt` unless it already exists. Returns whether it was written.
pub fn persist_test_urls(directory: &Path, urls: &[String]) -> AppResult<bool> {
    let path = directory.join(TEST_URLS_FILE);
    std::fs::create_dir_all(directory)?;
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(error) => return Err(error.into()),
    };
    file.write_all(urls.join("\n").as_bytes())?;
    Ok(true)
}
