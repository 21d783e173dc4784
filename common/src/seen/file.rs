// JSON-file seen-key store
//
// The whole key set is loaded on open and rewritten (temp file + rename) on
// every record, so a crash never leaves a torn document behind.

use super::SeenKeyStore;
use crate::errors::{SeenKeyError, StorageError};
use crate::models::SeenKeyEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SeenKeyDocument {
    keys: BTreeMap<String, SeenKeyEntry>,
}

/// Seen-key store persisted to a local JSON file
#[derive(Debug)]
pub struct FileSeenKeyStore {
    path: PathBuf,
    document: Mutex<SeenKeyDocument>,
}

impl FileSeenKeyStore {
    /// Open (or create on first write) the store at `path`
    #[instrument(skip_all)]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<SeenKeyDocument>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SeenKeyDocument::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            keys = document.keys.len(),
            "Seen-key file loaded"
        );

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &SeenKeyDocument) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(document)?;
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        // Contents must be durable before the rename publishes them
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!(path = %self.path.display(), keys = document.keys.len(), "Seen-key file written");
        Ok(())
    }
}

#[async_trait]
impl SeenKeyStore for FileSeenKeyStore {
    async fn has(&self, key: &str) -> Result<bool, SeenKeyError> {
        Ok(self.document.lock().await.keys.contains_key(key))
    }

    async fn record(&self, key: &str) -> Result<SeenKeyEntry, SeenKeyError> {
        let mut document = self.document.lock().await;
        if document.keys.contains_key(key) {
            return Err(SeenKeyError::DuplicateKey(key.to_string()));
        }

        let entry = SeenKeyEntry::now(key);
        document.keys.insert(key.to_string(), entry.clone());

        if let Err(e) = self.persist(&document).await {
            // Keep memory consistent with disk
            document.keys.remove(key);
            return Err(e.into());
        }

        Ok(entry)
    }

    async fn all_keys(&self) -> Result<HashSet<String>, SeenKeyError> {
        Ok(self.document.lock().await.keys.keys().cloned().collect())
    }
}
