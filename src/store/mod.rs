use crate::errors::{AppError, AppResult};
use crate::models::{FileMetadata, Instance, StoreContents, UpsertOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub const CONTENTS_FILE: &str = "contents.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Per-instance catalogue of file/record pairs plus the instance settings cache.
///
/// Every upsert against one instance runs under that instance's writer lock
/// and replaces `contents.json` by rename, so concurrent saves never drop
/// each other's entries. Entries are never purged.
#[derive(Debug)]
pub struct MetadataStore {
    root: PathBuf,
    writers: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    instances: RwLock<HashMap<String, Instance>>,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: StdMutex::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contents_path(&self, instance: &str) -> PathBuf {
        self.root.join(instance).join(CONTENTS_FILE)
    }

    pub fn settings_path(&self, instance: &str) -> PathBuf {
        self.root.join(instance).join(SETTINGS_FILE)
    }

    /// Missing or corrupt files read as an empty store.
    pub fn load(&self, instance: &str) -> StoreContents {
        let path = self.contents_path(instance);
        match read_json_file::<StoreContents>(&path) {
            Ok(contents) => contents,
            Err(error) => {
                if path.exists() {
                    tracing::warn!(path = %path.display(), error = %error, "unreadable metadata store, treating as empty");
                }
                StoreContents::default()
            }
        }
    }

    pub async fn upsert(&self, record: FileMetadata) -> AppResult<UpsertOutcome> {
        let instance = record.record.instance.name.clone();
        if instance.is_empty() {
            return Err(AppError::Internal("metadata record has no instance name".to_string()));
        }

        let writer = self.writer_for(&instance)?;
        let _guard = writer.lock().await;

        let mut contents = self.load(&instance);
        let outcome = match contents
            .files
            .iter_mut()
            .find(|entry| entry.record.sys_id == record.record.sys_id)
        {
            Some(existing) => {
                *existing = record;
                UpsertOutcome::Replaced
            }
            None => {
                contents.files.push(record);
                UpsertOutcome::Inserted
            }
        };

        write_json_file(&self.contents_path(&instance), &contents)?;
        Ok(outcome)
    }

    pub fn lookup_by_file_name(&self, instance: &str, file_name: &str) -> Option<FileMetadata> {
        self.load(instance)
            .files
            .into_iter()
            .find(|entry| entry.file_name == file_name)
    }

    /// Looks up a workspace file in the store of the instance its path belongs to.
    pub fn lookup_path(&self, path: &Path) -> Option<FileMetadata> {
        let instance = self.instance_for_path(path)?;
        self.lookup_by_file_name(&instance, &path.to_string_lossy())
    }

    pub fn instance_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        match relative.components().next()? {
            Component::Normal(part) => part.to_str().map(str::to_string),
            _ => None,
        }
    }

    pub async fn write_instance_settings(&self, instance: &Instance) -> AppResult<()> {
        if instance.name.is_empty() {
            return Err(AppError::MalformedMessage("instance settings without a name".to_string()));
        }
        {
            let mut cache = self.instances.write().await;
            cache.insert(instance.name.clone(), instance.clone());
        }
        write_json_file(&self.settings_path(&instance.name), instance)
    }

    /// Cached settings win; the settings file is the fallback.
    pub async fn instance_settings(&self, name: &str) -> Option<Instance> {
        if let Some(instance) = self.instances.read().await.get(name) {
            return Some(instance.clone());
        }
        read_json_file::<Instance>(&self.settings_path(name)).ok()
    }

    fn writer_for(&self, instance: &str) -> AppResult<Arc<Mutex<()>>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| AppError::Internal("metadata writer map poisoned".to_string()))?;
        Ok(writers
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

pub(crate) fn write_json_file<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|error| AppError::Internal(error.to_string()))?;
    write_atomic(path, &bytes)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| AppError::Persistence(error.to_string()))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
    fs::write(&staging, bytes).map_err(|error| AppError::Persistence(error.to_string()))?;
    if let Err(error) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(AppError::Persistence(error.to_string()));
    }
    Ok(())
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
    let bytes = fs::read(path).map_err(|error| AppError::Persistence(error.to_string()))?;
    serde_json::from_slice(&bytes).map_err(AppError::from)
}
