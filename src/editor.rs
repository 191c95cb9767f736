use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub character: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert { at: Position, text: String },
    Delete { start: Position, end: Position },
}

/// The editor the synced files are edited in.
#[async_trait]
pub trait Editor: Send + Sync {
    async fn show_warning(&self, message: &str);
    async fn show_info(&self, message: &str);
    /// Loads a document from disk; `reveal` brings it to the foreground.
    async fn open_document(&self, path: &Path, reveal: bool) -> AppResult<()>;
    async fn is_document_open(&self, path: &Path) -> bool;
    async fn focus_document(&self, path: &Path) -> AppResult<()>;
    async fn active_document(&self) -> Option<PathBuf>;
    async fn document_text(&self, path: &Path) -> AppResult<String>;
    async fn document_end(&self, path: &Path) -> AppResult<Position>;
    async fn apply_edit(&self, path: &Path, edit: TextEdit) -> AppResult<()>;
    async fn show_scope_tree(&self, payload: Value);
}

/// Scopes widget styles before they are pushed to live pages.
pub trait StylePreprocessor: Send + Sync {
    fn compile(&self, scss: &str) -> AppResult<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughStyles;

impl StylePreprocessor for PassthroughStyles {
    fn compile(&self, scss: &str) -> AppResult<String> {
        Ok(scss.to_string())
    }
}

#[derive(Debug, Default)]
struct HeadlessState {
    documents: HashMap<PathBuf, String>,
    active: Option<PathBuf>,
    warnings: Vec<String>,
    infos: Vec<String>,
    edits: Vec<(PathBuf, TextEdit)>,
    scope_trees: Vec<Value>,
}

/// In-memory editor used by the daemon and by tests.
///
/// Buffers are loaded from disk when opened; edits only touch the buffer.
/// Messages are forwarded to tracing.
#[derive(Debug, Default)]
pub struct HeadlessEditor {
    state: Mutex<HeadlessState>,
}

impl HeadlessEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_document(&self, path: &Path, text: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.documents.insert(path.to_path_buf(), text.into());
        state.active = Some(path.to_path_buf());
    }

    pub async fn close_document(&self, path: &Path) {
        let mut state = self.state.lock().await;
        state.documents.remove(path);
        if state.active.as_deref() == Some(path) {
            state.active = None;
        }
    }

    pub async fn warnings(&self) -> Vec<String> {
        self.state.lock().await.warnings.clone()
    }

    pub async fn infos(&self) -> Vec<String> {
        self.state.lock().await.infos.clone()
    }

    pub async fn edits(&self) -> Vec<(PathBuf, TextEdit)> {
        self.state.lock().await.edits.clone()
    }

    pub async fn scope_trees(&self) -> Vec<Value> {
        self.state.lock().await.scope_trees.clone()
    }
}

#[async_trait]
impl Editor for HeadlessEditor {
    async fn show_warning(&self, message: &str) {
        tracing::warn!(text = message, "editor warning");
        self.state.lock().await.warnings.push(message.to_string());
    }

    async fn show_info(&self, message: &str) {
        tracing::info!(text = message, "editor notice");
        self.state.lock().await.infos.push(message.to_string());
    }

    async fn open_document(&self, path: &Path, reveal: bool) -> AppResult<()> {
        let text = fs::read_to_string(path).map_err(|error| AppError::Persistence(error.to_string()))?;
        let mut state = self.state.lock().await;
        state.documents.insert(path.to_path_buf(), text);
        if reveal {
            state.active = Some(path.to_path_buf());
        }
        Ok(())
    }

    async fn is_document_open(&self, path: &Path) -> bool {
        self.state.lock().await.documents.contains_key(path)
    }

    async fn focus_document(&self, path: &Path) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.documents.contains_key(path) {
            return Err(AppError::Internal(format!("document not open: {}", path.display())));
        }
        state.active = Some(path.to_path_buf());
        Ok(())
    }

    async fn active_document(&self) -> Option<PathBuf> {
        self.state.lock().await.active.clone()
    }

    async fn document_text(&self, path: &Path) -> AppResult<String> {
        let state = self.state.lock().await;
        state
            .documents
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("document not open: {}", path.display())))
    }

    async fn document_end(&self, path: &Path) -> AppResult<Position> {
        let text = self.document_text(path).await?;
        let line = text.split('\n').count() - 1;
        let character = text.rsplit('\n').next().map(|last| last.chars().count()).unwrap_or(0);
        Ok(Position { line, character })
    }

    async fn apply_edit(&self, path: &Path, edit: TextEdit) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let Some(text) = state.documents.get_mut(path) else {
            return Err(AppError::Internal(format!("document not open: {}", path.display())));
        };
        match &edit {
            TextEdit::Insert { at, text: inserted } => {
                let offset = byte_offset(text, *at)?;
                text.insert_str(offset, inserted);
            }
            TextEdit::Delete { start, end } => {
                let from = byte_offset(text, *start)?;
                let to = byte_offset(text, *end)?;
                if from > to {
                    return Err(AppError::Internal("inverted delete range".to_string()));
                }
                text.replace_range(from..to, "");
            }
        }
        state.edits.push((path.to_path_buf(), edit));
        Ok(())
    }

    async fn show_scope_tree(&self, payload: Value) {
        let app = payload
            .get("appName")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        tracing::info!(app = %app, "application metadata received");
        self.state.lock().await.scope_trees.push(payload);
    }
}

fn byte_offset(text: &str, position: Position) -> AppResult<usize> {
    let mut line_start = 0usize;
    for _ in 0..position.line {
        let next = text[line_start..]
            .find('\n')
            .ok_or_else(|| AppError::Internal(format!("line {} out of range", position.line)))?;
        line_start += next + 1;
    }
    let line = text[line_start..].split('\n').next().unwrap_or("");
    if position.character == line.chars().count() {
        return Ok(line_start + line.len());
    }
    line.char_indices()
        .nth(position.character)
        .map(|(index, _)| line_start + index)
        .ok_or_else(|| AppError::Internal(format!("character {} out of range", position.character)))
}
