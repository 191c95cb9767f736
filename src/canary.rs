use crate::editor::{Editor, Position, TextEdit};
use crate::errors::AppResult;
use std::path::Path;

/// Flips a document's unsaved indicator without changing its text.
///
/// Inserts a blank at the end of the document, then deletes it once the
/// insert has been applied.
pub async fn mark_dirty(editor: &dyn Editor, path: &Path) -> AppResult<()> {
    let end = editor.document_end(path).await?;
    editor
        .apply_edit(
            path,
            TextEdit::Insert {
                at: end,
                text: " ".to_string(),
            },
        )
        .await?;
    editor
        .apply_edit(
            path,
            TextEdit::Delete {
                start: end,
                end: Position {
                    line: end.line,
                    character: end.character + 1,
                },
            },
        )
        .await
}
