use crate::models::{FileMetadata, Instance, RecordPayload, RecordRef};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const BACKGROUND_TABLE: &str = "background";
pub const WIDGET_TABLES: &[&str] = &["sp_widget", "sp_header_footer"];
pub const WIDGET_DESCRIPTOR_FILE: &str = "widget.json";
pub const TEST_URLS_FILE: &str = "test_urls.txt";
const SYS_ID_LEN: usize = 32;
const SCRATCH_EXTENSION: &str = "ts";
const SUFFIX_EXTENSION_TABLES: &[&str] = &["ecc_agent_script_file"];

static UNSAFE_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[^a-z0-9 .+\-]+").expect("valid name regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathParseError {
    #[error("path is outside the workspace root")]
    OutsideRoot,
    #[error("path has too few segments")]
    TooFewSegments,
    #[error("editor scratch file")]
    ScratchFile,
    #[error("file name has no sys_id segment")]
    MissingSysId,
    #[error("sys_id `{0}` is not a record identifier")]
    InvalidSysId(String),
    #[error("unknown widget field file `{0}`")]
    UnknownWidgetField(String),
    #[error("widget descriptor missing sys_id in {0}")]
    MissingWidgetDescriptor(String),
    #[error("no field name known for {0}")]
    UnknownField(String),
}

/// Field files a widget record is split into, in ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WidgetField {
    Template,
    Css,
    ClientScript,
    Script,
    Link,
    OptionSchema,
    DemoData,
}

impl WidgetField {
    pub const ALL: [WidgetField; 7] = [
        Self::Template,
        Self::Css,
        Self::ClientScript,
        Self::Script,
        Self::Link,
        Self::OptionSchema,
        Self::DemoData,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Css => "css",
            Self::ClientScript => "client_script",
            Self::Script => "script",
            Self::Link => "link",
            Self::OptionSchema => "option_schema",
            Self::DemoData => "demo_data",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Template => "1 HTML Template",
            Self::Css => "2 SCSS",
            Self::ClientScript => "3 Client Script",
            Self::Script => "4 Server Script",
            Self::Link => "5 Link function",
            Self::OptionSchema => "6 Option schema",
            Self::DemoData => "7 Demo data",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Template => "html",
            Self::Css => "scss",
            Self::ClientScript | Self::Script | Self::Link => "js",
            Self::OptionSchema | Self::DemoData => "json",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.{}", self.label(), self.extension())
    }

    /// Only the primary editable fields are surfaced in the editor.
    pub fn opens_in_editor(self) -> bool {
        matches!(self, Self::Template | Self::Css | Self::ClientScript | Self::Script)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.label() == label)
    }
}

/// A workspace path parsed against the record file grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPath {
    /// `{instance}/{table}/[{field}^]{name}^{sys_id}.{ext}`, optionally nested
    /// under a widget directory for dependent records.
    Field {
        instance: String,
        table: String,
        field: Option<String>,
        name: String,
        sys_id: String,
        extension: String,
    },
    /// `{instance}/{widget_table}/{widget}/{n Label}.{ext}`
    WidgetField {
        instance: String,
        table: String,
        widget: String,
        field: WidgetField,
        extension: String,
    },
}

impl RecordPath {
    pub fn parse(root: &Path, path: &Path) -> Result<Self, PathParseError> {
        let relative = path.strip_prefix(root).map_err(|_| PathParseError::OutsideRoot)?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    segments.push(part.to_str().ok_or(PathParseError::OutsideRoot)?.to_string())
                }
                _ => return Err(PathParseError::OutsideRoot),
            }
        }

        let Some(file_name) = segments.pop() else {
            return Err(PathParseError::TooFewSegments);
        };
        let (stem, extension) = split_extension(&file_name);
        if extension == SCRATCH_EXTENSION {
            return Err(PathParseError::ScratchFile);
        }

        match segments.as_slice() {
            [instance, table, widget] if is_widget_table(table) => {
                let field = WidgetField::from_label(stem)
                    .ok_or_else(|| PathParseError::UnknownWidgetField(file_name.clone()))?;
                Ok(Self::WidgetField {
                    instance: instance.clone(),
                    table: table.clone(),
                    widget: widget.clone(),
                    field,
                    extension: extension.to_string(),
                })
            }
            [instance, widget_table, _widget, table] if is_widget_table(widget_table) => {
                parse_field_stem(instance, table, stem, extension)
            }
            [instance, table] => parse_field_stem(instance, table, stem, extension),
            _ => Err(PathParseError::TooFewSegments),
        }
    }

    pub fn instance(&self) -> &str {
        match self {
            Self::Field { instance, .. } | Self::WidgetField { instance, .. } => instance,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Field { table, .. } | Self::WidgetField { table, .. } => table,
        }
    }
}

fn parse_field_stem(
    instance: &str,
    table: &str,
    stem: &str,
    extension: &str,
) -> Result<RecordPath, PathParseError> {
    let parts = stem.split('^').collect::<Vec<_>>();
    let (field, name, sys_id) = match parts.as_slice() {
        [field, name, sys_id] => (Some(field.to_string()), name.to_string(), sys_id.to_string()),
        [name, sys_id] => (None, name.to_string(), sys_id.to_string()),
        _ => return Err(PathParseError::MissingSysId),
    };
    if sys_id.len() != SYS_ID_LEN && table != BACKGROUND_TABLE {
        return Err(PathParseError::InvalidSysId(sys_id));
    }
    Ok(RecordPath::Field {
        instance: instance.to_string(),
        table: table.to_string(),
        field,
        name,
        sys_id,
        extension: extension.to_string(),
    })
}

fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rsplit_once('.') {
        Some((stem, extension)) => (stem, extension),
        None => (file_name, ""),
    }
}

pub fn is_widget_table(table: &str) -> bool {
    WIDGET_TABLES.contains(&table)
}

/// Resolves a workspace file to the remote field it mirrors.
///
/// `stored` is the metadata entry registered for this file, if any; it
/// supplies the field name for two-part file names and the full instance
/// settings. Widget files read their `sys_id` from the sibling descriptor.
pub fn path_to_record(
    root: &Path,
    path: &Path,
    content: String,
    stored: Option<&FileMetadata>,
) -> Result<RecordPayload, PathParseError> {
    let parsed = RecordPath::parse(root, path)?;
    let instance = stored
        .map(|meta| meta.record.instance.clone())
        .unwrap_or_else(|| Instance::named(parsed.instance()));
    let file_name = path.to_string_lossy().to_string();

    match parsed {
        RecordPath::Field {
            table,
            field,
            name,
            sys_id,
            ..
        } => {
            let field_name = field
                .or_else(|| stored.map(|meta| meta.record.field_name.clone()))
                .filter(|value| !value.is_empty())
                .ok_or_else(|| PathParseError::UnknownField(file_name.clone()))?;
            let name = stored
                .map(|meta| meta.record.name.clone())
                .filter(|value| !value.is_empty())
                .unwrap_or(name);
            Ok(RecordPayload {
                record: RecordRef {
                    instance,
                    table_name: table,
                    name,
                    field_name,
                    sys_id,
                },
                file_name,
                content,
                test_urls: Vec::new(),
            })
        }
        RecordPath::WidgetField {
            table,
            widget,
            field,
            ..
        } => {
            let directory = path.parent().unwrap_or(root);
            let descriptor = directory.join(WIDGET_DESCRIPTOR_FILE);
            let sys_id = read_json_lenient(&descriptor)
                .get("sys_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    PathParseError::MissingWidgetDescriptor(descriptor.to_string_lossy().to_string())
                })?;
            Ok(RecordPayload {
                record: RecordRef {
                    instance,
                    table_name: table,
                    name: widget,
                    field_name: field.field_name().to_string(),
                    sys_id,
                },
                file_name,
                content,
                test_urls: read_lines_lenient(&directory.join(TEST_URLS_FILE)),
            })
        }
    }
}

/// Canonical workspace-relative path for one remote field.
pub fn record_file_name(record: &RecordRef, field_type: &str) -> PathBuf {
    let sanitized = sanitize_name(&record.name);
    let (name, extension) =
        resolve_extension(&record.table_name, &record.field_name, field_type, sanitized);
    canonical_path(record, &name, &extension)
}

/// Like [`record_file_name`], for a caller that already knows the extension.
pub fn record_file_name_with_extension(record: &RecordRef, extension: &str) -> PathBuf {
    canonical_path(record, &sanitize_name(&record.name), extension)
}

fn canonical_path(record: &RecordRef, name: &str, extension: &str) -> PathBuf {
    PathBuf::from(&record.instance.name)
        .join(&record.table_name)
        .join(format!(
            "{}^{}^{}.{}",
            record.field_name.replace('.', "-"),
            name,
            record.sys_id,
            extension
        ))
}

/// Picks the file extension for a field and returns the possibly shortened name.
pub fn resolve_extension(
    table: &str,
    field_name: &str,
    field_type: &str,
    name: String,
) -> (String, String) {
    if field_type.contains("xml") {
        return (name, "xml".to_string());
    }
    if field_type.contains("html") {
        return (name, "html".to_string());
    }
    if field_type.contains("json") {
        return (name, "json".to_string());
    }
    if field_type.contains("css") || field_type.contains("properties") || field_name == "css" {
        return (name, "scss".to_string());
    }
    if SUFFIX_EXTENSION_TABLES.contains(&table) {
        if let Some((base, suffix)) = name.rsplit_once('-') {
            if !suffix.is_empty() && suffix.len() <= 4 {
                return (base.to_string(), suffix.to_string());
            }
        }
    }
    if field_type.contains("string") || field_type == "conditions" {
        return (name, "txt".to_string());
    }
    (name, "js".to_string())
}

/// Strips characters outside `[a-z0-9 .+-]` and folds dots to hyphens.
pub fn sanitize_name(name: &str) -> String {
    UNSAFE_NAME_CHARS.replace_all(name, "").replace('.', "-")
}

pub(crate) fn read_json_lenient(path: &Path) -> Value {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Default::default()))
}

pub(crate) fn read_lines_lenient(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}
