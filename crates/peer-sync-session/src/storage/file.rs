//! File-backed context store.
//!
//! The file holds a JSON object of named slots; the shared context lives
//! under a single slot (`applicationContext` by default). Other slots are
//! preserved on write.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use peer_sync_core::{Context, ContextStore, StorageError};
use serde_json::{Map, Value};

use super::CONTEXT_KEY;

/// Persistent context store backed by a JSON file.
pub struct FileContextStore {
    path: PathBuf,
    key: String,
}

impl FileContextStore {
    /// Create a store at `path` using the default slot name.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: CONTEXT_KEY.to_string(),
        }
    }

    /// Create a store in the platform data directory (`<data>/peer-sync/context.json`).
    ///
    /// # Errors
    /// Returns error if the platform has no data directory.
    pub fn default_location() -> Result<Self, StorageError> {
        let dir = dirs::data_dir()
            .ok_or_else(|| StorageError::Internal("no data directory available".to_string()))?;
        Ok(Self::new(dir.join("peer-sync").join("context.json")))
    }

    /// Use a different slot name.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_slots(&self) -> Result<Map<String, Value>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };

        // An unreadable file reads as empty and is replaced by the next save.
        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(slots)) => Ok(slots),
            Ok(_) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "context file is not a JSON object, ignoring it"
                );
                Ok(Map::new())
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "context file is corrupt, ignoring it"
                );
                Ok(Map::new())
            }
        }
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn load(&self) -> Result<Context, StorageError> {
        match self.read_slots().await?.remove(&self.key) {
            None | Some(Value::Null) => Ok(Context::new()),
            Some(Value::Object(context)) => Ok(context),
            Some(_) => {
                tracing::warn!(
                    key = %self.key,
                    "context slot does not hold an object, reading it as empty"
                );
                Ok(Context::new())
            }
        }
    }

    async fn save(&self, context: &Context) -> Result<(), StorageError> {
        let mut slots = self.read_slots().await?;
        slots.insert(self.key.clone(), Value::Object(context.clone()));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(&slots)
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        // Write-then-rename: readers never see a partial file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), key = %self.key, "context persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContextStore::new(dir.path().join("context.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_persists_under_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("context.json");
        let store = FileContextStore::new(&path);

        let mut context = Context::new();
        context.insert("theme".to_string(), json!("dark"));
        store.save(&context).await.unwrap();

        let reopened = FileContextStore::new(&path);
        assert_eq!(reopened.load().await.unwrap(), context);

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw, json!({"applicationContext": {"theme": "dark"}}));
    }

    #[tokio::test]
    async fn test_other_slots_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, r#"{"launchCount": 3}"#).unwrap();

        let store = FileContextStore::new(&path);
        store.save(&Context::new()).await.unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw, json!({"launchCount": 3, "applicationContext": {}}));
    }

    #[tokio::test]
    async fn test_corrupt_file_recovers_on_next_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FileContextStore::new(&path);

        let current = store.load().await.unwrap();
        assert!(current.is_empty());

        let mut incoming = Context::new();
        incoming.insert("theme".to_string(), json!("dark"));
        let outcome = peer_sync_core::merge(&current, &incoming);
        assert!(outcome.changed);
        store.save(&outcome.context).await.unwrap();

        assert_eq!(FileContextStore::new(&path).load().await.unwrap(), incoming);
    }

    #[tokio::test]
    async fn test_non_object_slot_reads_empty_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, r#"{"applicationContext": [1, 2], "launchCount": 3}"#).unwrap();
        let store = FileContextStore::new(&path);

        assert!(store.load().await.unwrap().is_empty());

        let mut context = Context::new();
        context.insert("a".to_string(), json!(1));
        store.save(&context).await.unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw, json!({"launchCount": 3, "applicationContext": {"a": 1}}));
    }

    #[test]
    fn test_default_location_under_data_dir() {
        match (FileContextStore::default_location(), dirs::data_dir()) {
            (Ok(store), Some(data)) => {
                assert_eq!(store.path(), data.join("peer-sync").join("context.json"));
            }
            (Err(err), None) => assert!(matches!(err, StorageError::Internal(_))),
            (store, data) => panic!(
                "mismatch: {:?} vs {data:?}",
                store.map(|s| s.path().to_path_buf())
            ),
        }
    }

    #[tokio::test]
    async fn test_custom_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        let store = FileContextStore::new(&path).with_key("watch");

        let mut context = Context::new();
        context.insert("a".to_string(), json!(1));
        store.save(&context).await.unwrap();

        assert!(FileContextStore::new(&path).load().await.unwrap().is_empty());
        assert_eq!(store.load().await.unwrap(), context);
    }
}
