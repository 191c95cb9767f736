use crate::canary;
use crate::channel::PeerRegistry;
use crate::editor::{Editor, PassthroughStyles, StylePreprocessor};
use crate::errors::{AppError, AppResult};
use crate::mapper::{self, RecordPath, WidgetField, BACKGROUND_TABLE};
use crate::models::{FileMetadata, Instance, OpenFileState, OpenRecordRequest, RecordPayload, RecordRef};
use crate::protocol::{
    ActionGoal, FieldResult, InboundMessage, LinkAppRequest, LiveUpdateMessage, MetadataResult,
    MirrorMessage, RequestAppMetaMessage, RequestMessage, RequestRecordMessage, SaveFieldRequest,
    SaveResponse, NO_CHANNEL_WARNING, UPDATE_METADATA_FIELDS,
};
use crate::store::{write_atomic, MetadataStore};
use crate::widget;
use chrono::{Local, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const NOT_RUNNING_NOTICE: &str = "ScriptSync server must be running";

/// What happened to an editor save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The file does not mirror a remote record.
    NotTracked,
    /// Tracked, but not forwarded (stopped, or a background script).
    Skipped,
    Forwarded(usize),
    /// No open peer; the document was marked dirty.
    NotDelivered,
}

/// The sync service: every request, channel message and editor event goes
/// through one shared instance.
pub struct SyncCore {
    root: PathBuf,
    store: MetadataStore,
    peers: PeerRegistry,
    editor: Arc<dyn Editor>,
    styles: Arc<dyn StylePreprocessor>,
    running: AtomicBool,
    open_files: Mutex<HashMap<PathBuf, OpenFileState>>,
    last_synced: Mutex<HashMap<PathBuf, String>>,
}

impl SyncCore {
    pub fn new(root: PathBuf, editor: Arc<dyn Editor>) -> Arc<Self> {
        Self::with_styles(root, editor, Arc::new(PassthroughStyles))
    }

    pub fn with_styles(
        root: PathBuf,
        editor: Arc<dyn Editor>,
        styles: Arc<dyn StylePreprocessor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: MetadataStore::new(root.clone()),
            root,
            peers: PeerRegistry::default(),
            editor,
            styles,
            running: AtomicBool::new(false),
            open_files: Mutex::new(HashMap::new()),
            last_synced: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        tracing::info!(root = %self.root.display(), "sync service started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.peers.close_all().await;
        tracing::info!("sync service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn open_file_state(&self, path: &Path) -> Option<OpenFileState> {
        self.open_files.lock().await.get(path).cloned()
    }

    /// True when `content` is what the service last wrote or forwarded for `path`.
    pub async fn is_last_synced(&self, path: &Path, content: &str) -> bool {
        self.last_synced
            .lock()
            .await
            .get(path)
            .is_some_and(|last| last == content)
    }

    // ─── Request endpoint ───────────────────────────────────────────────

    pub async fn handle_request_body(&self, body: &str) -> AppResult<()> {
        let request = RequestMessage::decode(body)?;
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: RequestMessage) -> AppResult<()> {
        match request {
            RequestMessage::SaveFieldAsFile(request) => self.save_field_as_file(request).await.map(|_| ()),
            RequestMessage::SaveWidget(payload) => self.save_widget(payload).await.map(|_| ()),
            RequestMessage::LinkApp(request) => self.link_app(request).await,
            RequestMessage::RequestedRecords(payload) => {
                let table = payload
                    .get("tableName")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                tracing::info!(table = %table, "requested records received");
                Ok(())
            }
            RequestMessage::WriteInstanceSettings(instance) => {
                self.store.write_instance_settings(&instance).await
            }
        }
    }

    /// Writes one field to `{instance}/{table}/{name}^{sys_id}.{ext}`, registers
    /// it in the store and asks the agent for its version metadata.
    pub async fn save_field_as_file(&self, request: SaveFieldRequest) -> AppResult<PathBuf> {
        let (name, extension) = mapper::resolve_extension(
            &request.table,
            &request.field,
            &request.field_type,
            mapper::sanitize_name(&request.name),
        );
        let path = self
            .root
            .join(&request.instance.name)
            .join(&request.table)
            .join(format!("{name}^{}.{extension}", request.sys_id));

        if let Err(error) = self.write_file(&path, &request.content, true).await {
            tracing::warn!(path = %path.display(), error = %error, "field write failed");
            let envelope = json!({
                "error": {"detail": error.to_string()},
                "response": {"result": {}},
            });
            if let Err(send_error) = self.peers.send_first(&envelope).await {
                tracing::debug!(error = %send_error, "write failure not reported to agent");
            }
            return Err(error);
        }

        let metadata = FileMetadata {
            record: RecordRef {
                instance: request.instance.clone(),
                table_name: request.table.clone(),
                name: request.name.clone(),
                field_name: request.field.clone(),
                sys_id: request.sys_id.clone(),
            },
            file_name: path.to_string_lossy().to_string(),
            content: Some(request.content.clone()),
            ..FileMetadata::default()
        };
        self.store.upsert(metadata.clone()).await?;

        let instance = self
            .store
            .instance_settings(&request.instance.name)
            .await
            .unwrap_or_else(|| request.instance.clone());
        let mut version_request = RequestRecordMessage::new(
            ActionGoal::GetMetadata,
            instance,
            request.table.clone(),
            request.sys_id.clone(),
        );
        version_request.meta = Some(metadata);
        self.request_remote(&version_request).await;

        let mut echo = to_json(&request)?;
        if let Some(object) = echo.as_object_mut() {
            object.insert("contentLength".to_string(), json!(request.content.len()));
        }
        self.echo_first(&echo).await;
        Ok(path)
    }

    pub async fn save_widget(&self, payload: Value) -> AppResult<PathBuf> {
        let split = widget::split_widget(&self.root, payload)?;
        for file in &split.files {
            self.write_file(&split.directory.join(&file.file_name), &file.content, file.open_file)
                .await?;
        }
        self.store.upsert(split.metadata()).await?;
        tracing::info!(
            widget = %split.record.name,
            fields = split.field_files().count(),
            content_length = split.content_length,
            "widget saved"
        );

        self.request_remote(&split.template_request).await;
        widget::persist_test_urls(&split.directory, &split.test_urls)?;
        if let Err(error) = self.peers.broadcast(split.status_message()).await {
            tracing::debug!(error = %error, "widget status not echoed");
        }
        Ok(split.directory)
    }

    pub async fn link_app(&self, request: LinkAppRequest) -> AppResult<()> {
        self.request_remote(&RequestAppMetaMessage::from(&request)).await;
        self.echo_first(&to_json(&request)?).await;
        Ok(())
    }

    // ─── Channel ────────────────────────────────────────────────────────

    /// Decodes and applies one channel message. Failures are logged, never raised.
    pub async fn handle_channel_message(&self, text: &str) {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(error = %error, "dropping malformed channel message");
                return;
            }
        };
        if let Err(error) = self.dispatch_inbound(message).await {
            tracing::warn!(error = %error, "channel message handling failed");
        }
    }

    pub async fn dispatch_inbound(&self, message: InboundMessage) -> AppResult<()> {
        match message {
            InboundMessage::RemoteError(error) => {
                self.editor.show_warning(&error.warning()).await;
                if let Some(active) = self.editor.active_document().await {
                    self.mark_dirty(&active).await;
                }
                Ok(())
            }
            InboundMessage::AppMeta(payload) => {
                self.editor.show_scope_tree(payload).await;
                Ok(())
            }
            InboundMessage::WriteInstanceSettings(instance) => {
                self.store.write_instance_settings(&instance).await
            }
            InboundMessage::UpdateCheck(result) => {
                self.merge_update_check(&result).await;
                Ok(())
            }
            InboundMessage::GetCurrent(result) => self.materialize_current(&result).await,
            InboundMessage::GetMetadata(result) => self.refresh_metadata(&result).await,
            InboundMessage::SaveResponse(response) => self.write_save_response(&response).await,
        }
    }

    async fn merge_update_check(&self, result: &FieldResult) {
        let mut open_files = self.open_files.lock().await;
        let entry = open_files
            .entry(PathBuf::from(&result.file_name))
            .or_insert_with(|| OpenFileState::new(String::new()));
        entry.refreshed = Utc::now();
        if let Some(value) = result.result_str("sys_updated_on") {
            entry.sys_updated_on = value.to_string();
        }
        if let Some(value) = result.result_str("sys_updated_by") {
            entry.sys_updated_by = value.to_string();
        }
        if let Some(value) = result.result_str("sys_scope.scope") {
            entry.scope = value.to_string();
        }
        entry.content = result.field_content().map(str::to_string);
    }

    async fn materialize_current(&self, result: &FieldResult) -> AppResult<()> {
        let path = self.resolve_remote_path(&result.file_name)?;
        let content = result.field_content().ok_or_else(|| {
            AppError::MalformedMessage(format!("current record lacks field `{}`", result.field_name))
        })?;
        if !self.accepts_remote_overwrite(&path, result) {
            return Ok(());
        }
        self.write_file(&path, content, true).await
    }

    /// Extension point for conflict detection before remote content replaces a
    /// local file. Remote `sys_updated_on` is not compared with local edits, so
    /// every overwrite proceeds.
    fn accepts_remote_overwrite(&self, _path: &Path, _remote: &FieldResult) -> bool {
        true
    }

    async fn refresh_metadata(&self, result: &MetadataResult) -> AppResult<()> {
        let path = self.resolve_remote_path(&result.meta.file_name)?;
        let Some(instance) = self.store.instance_for_path(&path) else {
            return Err(AppError::NotARecord(result.meta.file_name.clone()));
        };
        let Some(mut metadata) = self.store.lookup_by_file_name(&instance, &result.meta.file_name) else {
            tracing::debug!(file = %result.meta.file_name, "metadata for unregistered file ignored");
            return Ok(());
        };
        metadata.last_update = result.result.sys_updated_on.clone();
        metadata.last_updated_by = result.result.sys_updated_by.clone();
        self.store.upsert(metadata).await.map(|_| ())
    }

    async fn write_save_response(&self, response: &SaveResponse) -> AppResult<()> {
        let base = match (&response.file_path, &response.instance) {
            (Some(file_path), _) if !file_path.is_empty() => self.resolve_remote_path(file_path)?,
            (_, Some(instance)) if !instance.name.is_empty() => self.root.join(&instance.name),
            _ => {
                return Err(AppError::MalformedMessage(
                    "save response without target directory".to_string(),
                ))
            }
        };
        let directory = base.join(&response.table_name);

        let mut written = 0usize;
        let mut first_error = None;
        for result in &response.results {
            let sys_id = result.get("sys_id").map(value_text).unwrap_or_default();
            if sys_id.is_empty() {
                tracing::warn!(table = %response.table_name, "save response result without sys_id");
                continue;
            }
            let display = result
                .get(&response.display_value_field)
                .map(value_text)
                .unwrap_or_default();
            for field in &response.fields {
                let content = result.get(&field.name).map(value_text).unwrap_or_default();
                let file_name = format!(
                    "{}^{}^{}.{}",
                    field.name.replace('.', "-"),
                    mapper::sanitize_name(&display),
                    sys_id,
                    field.file_type
                );
                match self.write_file(&directory.join(file_name), &content, false).await {
                    Ok(()) => written += 1,
                    Err(error) => {
                        tracing::warn!(table = %response.table_name, error = %error, "save response write failed");
                        first_error.get_or_insert(error);
                    }
                }
            }
        }
        tracing::info!(table = %response.table_name, written, "save response materialized");
        first_error.map_or(Ok(()), Err)
    }

    // ─── Editor events ──────────────────────────────────────────────────

    pub async fn on_document_opened(&self, path: &Path, text: &str) {
        if RecordPath::parse(&self.root, path).is_err() {
            return;
        }
        self.open_files
            .lock()
            .await
            .insert(path.to_path_buf(), OpenFileState::new(text.to_string()));
    }

    pub async fn on_document_closed(&self, path: &Path) {
        self.open_files.lock().await.remove(path);
    }

    /// Forwards a saved record file to every open peer.
    pub async fn on_document_saved(&self, path: &Path, text: &str) -> SaveOutcome {
        if !self.is_running() {
            return SaveOutcome::Skipped;
        }
        let payload = match self.resolve_record(path, text.to_string()).await {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(path = %path.display(), error = %error, "save of untracked file");
                return SaveOutcome::NotTracked;
            }
        };
        if payload.record.table_name == BACKGROUND_TABLE {
            return SaveOutcome::Skipped;
        }

        match self.peers.broadcast(&payload).await {
            Ok(delivered) => {
                tracing::info!(path = %path.display(), sys_id = %payload.record.sys_id, delivered, "save forwarded");
                SaveOutcome::Forwarded(delivered)
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "save not forwarded");
                self.editor.show_warning(NO_CHANNEL_WARNING).await;
                self.mark_dirty(path).await;
                SaveOutcome::NotDelivered
            }
        }
    }

    /// Live style updates for widget css and mirroring for background scripts.
    pub async fn on_document_changed(&self, path: &Path, text: &str) -> AppResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        match RecordPath::parse(&self.root, path) {
            Ok(RecordPath::WidgetField {
                field: WidgetField::Css,
                ..
            }) => self.push_live_styles(path, text).await,
            Ok(RecordPath::Field { ref table, .. }) if table == BACKGROUND_TABLE => {
                let payload = self.resolve_record(path, text.to_string()).await?;
                self.broadcast_or_warn(&MirrorMessage {
                    payload,
                    mirrorbgscript: true,
                })
                .await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn push_live_styles(&self, path: &Path, text: &str) -> AppResult<()> {
        let payload = self.resolve_record(path, String::new()).await?;
        if payload.test_urls.is_empty() {
            tracing::debug!(path = %path.display(), "widget has no test urls, live update skipped");
            return Ok(());
        }
        let scss = format!(".v{} {{ {} }}", payload.record.sys_id, text);
        let message = LiveUpdateMessage {
            liveupdate: true,
            sys_id: payload.record.sys_id,
            css: self.styles.compile(&scss)?,
            test_urls: payload.test_urls.iter().map(|url| format!("{url}*")).collect(),
        };
        self.broadcast_or_warn(&message).await;
        Ok(())
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Focuses the record's file when it is open, otherwise asks the agent for it.
    pub async fn open_record(&self, request: OpenRecordRequest) -> AppResult<PathBuf> {
        let record = RecordRef {
            instance: request.instance.clone(),
            table_name: request.table_name.clone(),
            name: request.name.clone(),
            field_name: request.field_name.clone(),
            sys_id: request.sys_id.clone(),
        };
        let path = self
            .root
            .join(mapper::record_file_name_with_extension(&record, &request.extension));
        self.ensure_within_root(&path)?;

        if self.editor.is_document_open(&path).await {
            self.editor.focus_document(&path).await?;
            return Ok(path);
        }

        let mut message = RequestRecordMessage::new(
            ActionGoal::GetCurrent,
            request.instance,
            request.table_name,
            format!(
                "{}?sysparm_fields={},{}",
                request.sys_id, UPDATE_METADATA_FIELDS, request.field_name
            ),
        );
        message.field_name = Some(request.field_name);
        message.file_name = Some(path.to_string_lossy().to_string());
        message.name = Some(request.name);
        self.request_remote(&message).await;
        Ok(path)
    }

    /// Turns a selection into a background script and sends it for execution.
    pub async fn selection_to_background(
        &self,
        source: &Path,
        selection: &str,
    ) -> AppResult<Option<PathBuf>> {
        if !self.is_running() {
            self.editor.show_info(NOT_RUNNING_NOTICE).await;
            return Ok(None);
        }
        let parsed = RecordPath::parse(&self.root, source)?;
        let instance = self
            .store
            .instance_settings(parsed.instance())
            .await
            .unwrap_or_else(|| Instance::named(parsed.instance()));
        let source_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let request = SaveFieldRequest {
            name: "script".to_string(),
            table: BACKGROUND_TABLE.to_string(),
            field: "bg".to_string(),
            field_type: "script".to_string(),
            sys_id: Local::now().format("%Y%m%d-%H%M%S").to_string(),
            instance,
            content: format!(
                "// ScriptSync snippet from {source_name}, delete this file after use\n// file://{}\n\n{selection}",
                source.display()
            ),
            mirrorbgscript: true,
            extra: Map::new(),
        };
        self.save_field_as_file(request).await.map(Some)
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    async fn resolve_record(&self, path: &Path, content: String) -> AppResult<RecordPayload> {
        let stored = self.store.lookup_path(path);
        let mut payload = mapper::path_to_record(&self.root, path, content, stored.as_ref())?;
        if payload.record.instance.url.is_empty() {
            if let Some(instance) = self.store.instance_settings(&payload.record.instance.name).await {
                payload.record.instance = instance;
            }
        }
        Ok(payload)
    }

    async fn write_file(&self, path: &Path, content: &str, open: bool) -> AppResult<()> {
        self.ensure_within_root(path)?;
        self.last_synced
            .lock()
            .await
            .insert(path.to_path_buf(), content.to_string());
        if let Err(error) = write_atomic(path, content.as_bytes()) {
            self.last_synced.lock().await.remove(path);
            return Err(error);
        }
        if open {
            if let Err(error) = self.editor.open_document(path, true).await {
                tracing::warn!(path = %path.display(), error = %error, "written file not opened");
                return Ok(());
            }
            self.open_files
                .lock()
                .await
                .entry(path.to_path_buf())
                .or_insert_with(|| OpenFileState::new(content.to_string()));
        }
        Ok(())
    }

    async fn mark_dirty(&self, path: &Path) {
        if !self.is_running() {
            return;
        }
        if let Err(error) = canary::mark_dirty(self.editor.as_ref(), path).await {
            tracing::debug!(path = %path.display(), error = %error, "dirty mark failed");
        }
    }

    /// Outbound requests are dropped while stopped.
    async fn request_remote<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        if !self.is_running() {
            tracing::debug!("service stopped, outbound request dropped");
            return false;
        }
        self.broadcast_or_warn(message).await
    }

    async fn broadcast_or_warn<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        match self.peers.broadcast(message).await {
            Ok(_) => true,
            Err(AppError::NoChannel) => {
                self.editor.show_warning(NO_CHANNEL_WARNING).await;
                false
            }
            Err(error) => {
                tracing::warn!(error = %error, "broadcast failed");
                false
            }
        }
    }

    async fn echo_first(&self, message: &Value) {
        if let Err(error) = self.peers.send_first(message).await {
            tracing::debug!(error = %error, "status echo not delivered");
        }
    }

    fn ensure_within_root(&self, path: &Path) -> AppResult<()> {
        let inside = path
            .strip_prefix(&self.root)
            .map(|relative| {
                relative.components().next().is_some()
                    && relative
                        .components()
                        .all(|component| matches!(component, Component::Normal(_)))
            })
            .unwrap_or(false);
        if inside {
            Ok(())
        } else {
            Err(AppError::NotARecord(format!(
                "{} is outside the workspace",
                path.display()
            )))
        }
    }

    fn resolve_remote_path(&self, value: &str) -> AppResult<PathBuf> {
        let path = PathBuf::from(value);
        self.ensure_within_root(&path)?;
        Ok(path)
    }
}

fn to_json<T: Serialize>(value: &T) -> AppResult<Value> {
    serde_json::to_value(value).map_err(|error| AppError::Internal(error.to_string()))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Admission;
    use crate::editor::HeadlessEditor;
    use crate::protocol::{MetadataRef, RequestedField, UpdateStamp};
    use serde_json::json;
    use std::fs;
    use tokio::sync::mpsc;

    const SYS_ID: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4";

    fn service(root: &Path) -> (Arc<SyncCore>, Arc<HeadlessEditor>) {
        let editor = Arc::new(HeadlessEditor::new());
        let core = SyncCore::new(root.to_path_buf(), editor.clone());
        core.start();
        (core, editor)
    }

    async fn connect(core: &SyncCore) -> mpsc::Receiver<String> {
        match core.peers().admit().await {
            Admission::Accepted { receiver, .. } => receiver,
            Admission::Rejected => panic!("peer rejected"),
        }
    }

    fn next_json(receiver: &mut mpsc::Receiver<String>) -> Value {
        let text = receiver.try_recv().expect("queued message");
        serde_json::from_str(&text).expect("json message")
    }

    fn save_request(content: &str) -> SaveFieldRequest {
        SaveFieldRequest {
            name: "Test Script".to_string(),
            table: "sys_script".to_string(),
            field: "script".to_string(),
            field_type: "script".to_string(),
            sys_id: SYS_ID.to_string(),
            instance: Instance {
                url: "https://dev1.example.com".to_string(),
                ..Instance::named("dev1")
            },
            content: content.to_string(),
            mirrorbgscript: false,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn save_field_requests_metadata_then_echoes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let mut peer = connect(&core).await;

        let path = core.save_field_as_file(save_request("log('hi');")).await.expect("save");
        assert_eq!(
            path,
            dir.path().join(format!("dev1/sys_script/Test Script^{SYS_ID}.js"))
        );

        let version = next_json(&mut peer);
        assert_eq!(version["action"], "requestRecord");
        assert_eq!(version["actionGoal"], "getMetadata");
        assert_eq!(version["meta"]["fileName"], path.to_string_lossy().to_string());

        let echo = next_json(&mut peer);
        assert_eq!(echo["sys_id"], SYS_ID);
        assert_eq!(echo["contentLength"], 10);
        assert!(echo.get("mirrorbgscript").is_none());
    }

    #[tokio::test]
    async fn saved_field_forwards_with_stored_field_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let path = core.save_field_as_file(save_request("a")).await.expect("save");
        let mut peer = connect(&core).await;

        let outcome = core.on_document_saved(&path, "b").await;
        assert_eq!(outcome, SaveOutcome::Forwarded(1));
        let forwarded = next_json(&mut peer);
        assert_eq!(forwarded["fieldName"], "script");
        assert_eq!(forwarded["tableName"], "sys_script");
        assert_eq!(forwarded["content"], "b");
        assert_eq!(forwarded["instance"]["url"], "https://dev1.example.com");
    }

    #[tokio::test]
    async fn undelivered_save_warns_and_marks_dirty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        let path = core.save_field_as_file(save_request("x = 1;")).await.expect("save");

        let outcome = core.on_document_saved(&path, "x = 1;").await;
        assert_eq!(outcome, SaveOutcome::NotDelivered);
        assert!(editor.warnings().await.iter().any(|w| w == NO_CHANNEL_WARNING));
        assert_eq!(editor.edits().await.len(), 2);
        assert_eq!(editor.document_text(&path).await.expect("text"), "x = 1;");
    }

    #[tokio::test]
    async fn untracked_and_stopped_saves_are_not_forwarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let outcome = core.on_document_saved(&dir.path().join("notes.txt"), "x").await;
        assert_eq!(outcome, SaveOutcome::NotTracked);

        core.stop().await;
        let path = dir.path().join(format!("dev1/sys_script/script^a^{SYS_ID}.js"));
        assert_eq!(core.on_document_saved(&path, "x").await, SaveOutcome::Skipped);
    }

    #[tokio::test]
    async fn update_check_merges_into_open_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let file_name = dir.path().join(format!("dev1/sys_script/script^a^{SYS_ID}.js"));
        core.on_document_opened(&file_name, "local").await;

        core.dispatch_inbound(InboundMessage::UpdateCheck(FieldResult {
            file_name: file_name.to_string_lossy().to_string(),
            field_name: "script".to_string(),
            result: json!({
                "sys_updated_on": "2026-10-19 08:00:00",
                "sys_updated_by": "admin",
                "sys_scope.scope": "global",
                "script": "remote"
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        }))
        .await
        .expect("update check");

        let state = core.open_file_state(&file_name).await.expect("open file");
        assert_eq!(state.original_content, "local");
        assert_eq!(state.sys_updated_by, "admin");
        assert_eq!(state.scope, "global");
        assert_eq!(state.content.as_deref(), Some("remote"));

        core.on_document_closed(&file_name).await;
        assert!(core.open_file_state(&file_name).await.is_none());
    }

    #[tokio::test]
    async fn get_current_writes_and_opens_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        let path = dir.path().join(format!("dev1/sys_script/script^a^{SYS_ID}.js"));

        core.handle_channel_message(
            &json!({
                "action": "requestRecord",
                "actionGoal": "getCurrent",
                "fileName": path.to_string_lossy(),
                "fieldName": "script",
                "result": {"script": "gs.info('remote');"}
            })
            .to_string(),
        )
        .await;

        assert_eq!(fs::read_to_string(&path).expect("file"), "gs.info('remote');");
        assert_eq!(editor.active_document().await, Some(path.clone()));
        assert!(core.is_last_synced(&path, "gs.info('remote');").await);
    }

    #[tokio::test]
    async fn remote_paths_outside_the_workspace_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let outside = dir.path().join("../escape.js");
        let result = core
            .dispatch_inbound(InboundMessage::GetCurrent(FieldResult {
                file_name: outside.to_string_lossy().to_string(),
                field_name: "script".to_string(),
                result: json!({"script": "x"}).as_object().cloned().unwrap_or_default(),
            }))
            .await;
        assert!(matches!(result, Err(AppError::NotARecord(_))));
        assert!(!dir.path().join("../escape.js").exists());
    }

    #[tokio::test]
    async fn get_metadata_updates_stored_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let path = core.save_field_as_file(save_request("x")).await.expect("save");

        core.dispatch_inbound(InboundMessage::GetMetadata(MetadataResult {
            meta: MetadataRef {
                file_name: path.to_string_lossy().to_string(),
            },
            result: UpdateStamp {
                sys_updated_on: Some("2026-10-19 09:30:00".to_string()),
                sys_updated_by: Some("dev.user".to_string()),
            },
        }))
        .await
        .expect("metadata");

        let stored = core.store().lookup_path(&path).expect("stored");
        assert_eq!(stored.last_update.as_deref(), Some("2026-10-19 09:30:00"));
        assert_eq!(stored.last_updated_by.as_deref(), Some("dev.user"));
        assert_eq!(core.store().load("dev1").files.len(), 1);
    }

    #[tokio::test]
    async fn save_response_writes_one_file_per_result_and_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        let other = "ffffffffffffffffffffffffffffffff";

        core.dispatch_inbound(InboundMessage::SaveResponse(SaveResponse {
            instance: Some(Instance::named("dev1")),
            file_path: None,
            table_name: "sys_script_include".to_string(),
            display_value_field: "name".to_string(),
            fields: vec![RequestedField {
                name: "script".to_string(),
                file_type: "js".to_string(),
            }],
            results: vec![
                json!({"sys_id": SYS_ID, "name": "Util.Helper", "script": "var a;"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                json!({"sys_id": other, "name": "Other", "script": "var b;"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ],
        }))
        .await
        .expect("save response");

        let table = dir.path().join("dev1/sys_script_include");
        assert_eq!(
            fs::read_to_string(table.join(format!("script^Util-Helper^{SYS_ID}.js"))).expect("first"),
            "var a;"
        );
        assert!(table.join(format!("script^Other^{other}.js")).exists());
        assert!(editor.active_document().await.is_none());
    }

    #[tokio::test]
    async fn write_failure_sends_error_envelope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        fs::write(dir.path().join("dev1"), "a file where the instance dir should be").expect("blocker");
        let mut peer = connect(&core).await;

        let error = core
            .save_field_as_file(save_request("x"))
            .await
            .expect_err("write must fail");
        assert!(error.is_persistence());

        let envelope = next_json(&mut peer);
        assert!(envelope["error"]["detail"]
            .as_str()
            .is_some_and(|detail| detail.starts_with("PERSISTENCE_FAILURE")));
        assert_eq!(envelope["response"]["result"], json!({}));
        assert!(peer.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_record_focuses_open_file_or_requests_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        let mut peer = connect(&core).await;
        let request = OpenRecordRequest {
            instance: Instance::named("dev1"),
            table_name: "sys_script".to_string(),
            field_name: "script".to_string(),
            name: "My Rule".to_string(),
            sys_id: SYS_ID.to_string(),
            extension: "js".to_string(),
        };

        let path = core.open_record(request.clone()).await.expect("request");
        let message = next_json(&mut peer);
        assert_eq!(message["actionGoal"], "getCurrent");
        assert_eq!(
            message["sys_id"],
            format!("{SYS_ID}?sysparm_fields={UPDATE_METADATA_FIELDS},script")
        );
        assert_eq!(message["fileName"], path.to_string_lossy().to_string());

        editor.set_document(&path, "open").await;
        editor.set_document(&dir.path().join("other.js"), "other").await;
        core.open_record(request).await.expect("focus");
        assert_eq!(editor.active_document().await, Some(path));
        assert!(peer.try_recv().is_err());
    }

    #[tokio::test]
    async fn css_edit_pushes_scoped_live_update() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let widget_dir = dir.path().join("dev1/sp_widget/Card");
        fs::create_dir_all(&widget_dir).expect("widget dir");
        fs::write(widget_dir.join("widget.json"), json!({"sys_id": SYS_ID}).to_string()).expect("descriptor");
        let mut peer = connect(&core).await;

        core.on_document_changed(&widget_dir.join("2 SCSS.scss"), ".a { color: red; }")
            .await
            .expect("no test urls");
        assert!(peer.try_recv().is_err());

        fs::write(widget_dir.join("test_urls.txt"), "https://x/sp?id=a\nhttps://x/sp?id=b").expect("urls");
        core.on_document_changed(&widget_dir.join("2 SCSS.scss"), ".a { color: red; }")
            .await
            .expect("live update");
        let update = next_json(&mut peer);
        assert_eq!(update["liveupdate"], true);
        assert_eq!(update["css"], format!(".v{SYS_ID} {{ .a {{ color: red; }} }}"));
        assert_eq!(update["testUrls"], json!(["https://x/sp?id=a*", "https://x/sp?id=b*"]));
    }

    #[tokio::test]
    async fn selection_becomes_mirrored_background_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let source = dir.path().join(format!("dev1/sys_script/script^Rule^{SYS_ID}.js"));

        let path = core
            .selection_to_background(&source, "gs.info('hi');")
            .await
            .expect("mirror")
            .expect("path");
        assert_eq!(path.parent(), Some(dir.path().join("dev1/background").as_path()));
        let content = fs::read_to_string(&path).expect("background file");
        assert_eq!(content.lines().count(), 4);
        assert!(content.ends_with("gs.info('hi');"));

        let mut peer = connect(&core).await;
        core.on_document_changed(&path, "gs.info('edited');").await.expect("mirror change");
        let mirrored = next_json(&mut peer);
        assert_eq!(mirrored["mirrorbgscript"], true);
        assert_eq!(mirrored["fieldName"], "bg");
        assert_eq!(mirrored["tableName"], "background");
        assert_eq!(core.on_document_saved(&path, "x").await, SaveOutcome::Skipped);
    }

    #[tokio::test]
    async fn selection_mirroring_requires_running_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        core.stop().await;
        let source = dir.path().join(format!("dev1/sys_script/script^Rule^{SYS_ID}.js"));
        assert!(core.selection_to_background(&source, "x").await.expect("notice").is_none());
        assert_eq!(editor.infos().await, vec![NOT_RUNNING_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn app_meta_and_settings_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        core.handle_channel_message(r#"{"action":"requestAppMeta","appName":"Fleet"}"#).await;
        core.handle_channel_message(
            r#"{"action":"writeInstanceSettings","instance":{"name":"dev2","url":"https://dev2"}}"#,
        )
        .await;
        core.handle_channel_message("not json").await;

        assert_eq!(editor.scope_trees().await.len(), 1);
        let settings = core.store().instance_settings("dev2").await.expect("settings");
        assert_eq!(settings.url, "https://dev2");
    }

    fn link_app_body() -> String {
        r#"{"action":"linkAppToVSCode","appId":"a1","appName":"Fleet","appScope":"x_fleet","instance":{"name":"dev1","url":"https://dev1.example.com"}}"#.to_string()
    }

    #[tokio::test]
    async fn link_app_requests_app_meta_then_echoes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());
        let mut peer = connect(&core).await;

        core.handle_request_body(&link_app_body()).await.expect("link app");

        let request = next_json(&mut peer);
        assert_eq!(request["action"], "requestAppMeta");
        assert_eq!(request["actionGoal"], "saveCheck");
        assert_eq!(request["appId"], "a1");
        assert_eq!(request["appName"], "Fleet");
        assert_eq!(request["appScope"], "x_fleet");
        assert_eq!(request["instance"]["name"], "dev1");

        let echo = next_json(&mut peer);
        assert_eq!(echo["action"], "linkAppToVSCode");
        assert_eq!(echo["appName"], "Fleet");
        assert!(peer.try_recv().is_err());
        assert!(editor.warnings().await.is_empty());
    }

    #[tokio::test]
    async fn link_app_without_peer_warns_no_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, editor) = service(dir.path());

        core.handle_request_body(&link_app_body()).await.expect("link app");
        assert_eq!(editor.warnings().await, vec![NO_CHANNEL_WARNING.to_string()]);
    }

    #[tokio::test]
    async fn saved_widget_requests_templates_then_echoes_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, _) = service(dir.path());
        let mut peer = connect(&core).await;

        let directory = core
            .save_widget(json!({
                "action": "saveWidget",
                "name": "Hero",
                "table": "sp_widget",
                "sys_id": SYS_ID,
                "instance": {"name": "dev1", "url": "https://dev1.example.com"},
                "widget": {
                    "template": {"value": "<p></p>"},
                    "css": {"value": ".a {}"},
                    "client_script": {"value": ""},
                    "script": {"value": ""},
                    "link": {"value": ""},
                    "option_schema": {"value": "[]"},
                    "demo_data": {"value": "{}"}
                }
            }))
            .await
            .expect("save widget");

        let request = next_json(&mut peer);
        assert_eq!(request["action"], "requestRecords");
        assert_eq!(request["actionGoal"], "saveCheck");
        assert_eq!(request["tableName"], "sp_ng_template");
        assert_eq!(request["filePath"], directory.to_string_lossy().to_string());
        assert_eq!(request["queryString"], format!("sysparm_query=sp_widget={SYS_ID}"));

        let status = next_json(&mut peer);
        assert_eq!(status["widget"], json!({}));
        assert_eq!(status["result"], json!({}));
        assert_eq!(status["content"]["length"], 16);
        assert_eq!(status["sys_id"], SYS_ID);
        assert!(peer.try_recv().is_err());
    }
}
