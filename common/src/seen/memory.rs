use super::SeenKeyStore;
use crate::errors::SeenKeyError;
use crate::models::SeenKeyEntry;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Process-local seen-key store; does not survive restarts
#[derive(Debug, Default)]
pub struct InMemorySeenKeyStore {
    entries: RwLock<HashMap<String, SeenKeyEntry>>,
}

impl InMemorySeenKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for a key, if recorded
    pub async fn entry(&self, key: &str) -> Option<SeenKeyEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SeenKeyStore for InMemorySeenKeyStore {
    async fn has(&self, key: &str) -> Result<bool, SeenKeyError> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn record(&self, key: &str) -> Result<SeenKeyEntry, SeenKeyError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Err(SeenKeyError::DuplicateKey(key.to_string()));
        }
        let entry = SeenKeyEntry::now(key);
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn all_keys(&self) -> Result<HashSet<String>, SeenKeyError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}
