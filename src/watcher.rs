use crate::config::STATE_DIR;
use crate::dispatcher::{SaveOutcome, SyncCore};
use crate::errors::{AppError, AppResult};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Feeds on-disk edits of tracked files into the save path.
pub struct SaveWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl SaveWatcher {
    pub fn spawn(core: Arc<SyncCore>) -> AppResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let _ = sender.send(event);
                }
                Err(error) => tracing::warn!(error = %error, "file watcher error"),
            }
        })
        .map_err(|error| AppError::Internal(error.to_string()))?;
        watcher
            .watch(core.root(), RecursiveMode::Recursive)
            .map_err(|error| AppError::Internal(error.to_string()))?;

        let root = core.root().to_path_buf();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if !is_content_change(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if is_candidate(core.root(), &path) {
                        forward_save(&core, &path).await;
                    }
                }
            }
        });
        tracing::info!(root = %root.display(), "watching workspace for saves");

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Skips service state, hidden staging files and directories.
fn is_candidate(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    if relative.starts_with(STATE_DIR) {
        return false;
    }
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'));
    !hidden && path.is_file()
}

async fn forward_save(core: &SyncCore, path: &Path) {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(error) => {
            tracing::debug!(path = %path.display(), error = %error, "changed file unreadable");
            return;
        }
    };
    if core.is_last_synced(path, &text).await {
        return;
    }
    match core.on_document_saved(path, &text).await {
        SaveOutcome::Forwarded(delivered) => {
            tracing::debug!(path = %path.display(), delivered, "on-disk save forwarded")
        }
        SaveOutcome::NotDelivered => {
            tracing::debug!(path = %path.display(), "on-disk save not delivered")
        }
        SaveOutcome::NotTracked | SaveOutcome::Skipped => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Admission;
    use crate::editor::HeadlessEditor;

    const SYS_ID: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4";

    #[test]
    fn state_and_staging_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join(".scriptsync/logs")).expect("state dir");
        std::fs::create_dir_all(root.join("dev1/sys_script")).expect("table dir");
        std::fs::write(root.join(".scriptsync/logs/scriptsync.log"), "x").expect("log");
        std::fs::write(root.join("dev1/.contents.json.abc.tmp"), "x").expect("staging");
        std::fs::write(root.join("dev1/sys_script/a.js"), "x").expect("record");

        assert!(!is_candidate(root, &root.join(".scriptsync/logs/scriptsync.log")));
        assert!(!is_candidate(root, &root.join("dev1/.contents.json.abc.tmp")));
        assert!(!is_candidate(root, &root.join("dev1/sys_script")));
        assert!(!is_candidate(root, Path::new("/elsewhere/a.js")));
        assert!(is_candidate(root, &root.join("dev1/sys_script/a.js")));
    }

    #[test]
    fn only_content_events_count() {
        assert!(is_content_change(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_content_change(&EventKind::Access(notify::event::AccessKind::Any)));
        assert!(!is_content_change(&EventKind::Remove(notify::event::RemoveKind::File)));
    }

    #[tokio::test]
    async fn undelivered_disk_save_is_retried_on_next_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = SyncCore::new(dir.path().to_path_buf(), Arc::new(HeadlessEditor::new()));
        core.start();
        let body = format!(
            r#"{{"action":"saveFieldAsFile","name":"Rule","table":"sys_script","field":"script","fieldType":"script","sys_id":"{SYS_ID}","instance":{{"name":"dev1"}},"content":"original"}}"#
        );
        core.handle_request_body(&body).await.expect("save field");
        let path = dir.path().join(format!("dev1/sys_script/Rule^{SYS_ID}.js"));

        std::fs::write(&path, "edited").expect("first edit");
        forward_save(&core, &path).await;
        assert!(!core.is_last_synced(&path, "edited").await);

        let Admission::Accepted { mut receiver, .. } = core.peers().admit().await else {
            panic!("peer rejected");
        };
        std::fs::write(&path, "edited").expect("second save");
        forward_save(&core, &path).await;

        let text = receiver.try_recv().expect("retried save delivered");
        let forwarded: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(forwarded["content"], "edited");
        assert_eq!(forwarded["fieldName"], "script");
    }

    #[tokio::test]
    async fn files_written_by_the_service_are_not_echoed_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = SyncCore::new(dir.path().to_path_buf(), Arc::new(HeadlessEditor::new()));
        core.start();
        let body = format!(
            r#"{{"action":"saveFieldAsFile","name":"Rule","table":"sys_script","field":"script","fieldType":"script","sys_id":"{SYS_ID}","instance":{{"name":"dev1"}},"content":"original"}}"#
        );
        core.handle_request_body(&body).await.expect("save field");
        let path = dir.path().join(format!("dev1/sys_script/Rule^{SYS_ID}.js"));

        let Admission::Accepted { mut receiver, .. } = core.peers().admit().await else {
            panic!("peer rejected");
        };
        forward_save(&core, &path).await;
        assert!(receiver.try_recv().is_err());
    }
}
