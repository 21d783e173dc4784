// Discovery sources polled by sensors

use crate::config::S3Config;
use crate::errors::{DiscoveryError, StorageError};
use crate::storage::{ObjectSummary, S3Client};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// DiscoverySource trait: lists candidate keys for a sensor tick
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Candidate keys in discovery order; fails with `DiscoveryError::Unavailable` on transport failure
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, DiscoveryError>;
}

/// Lists objects under a prefix of an S3-compatible bucket, oldest first.
///
/// Clients are built once per bucket and reused across polls.
pub struct S3DiscoverySource {
    config: S3Config,
    clients: Mutex<HashMap<String, S3Client>>,
    max_keys: Option<usize>,
}

impl S3DiscoverySource {
    /// Build the source with a ready client for the bucket it will poll
    pub async fn new(config: &S3Config, bucket: &str) -> Result<Self, StorageError> {
        let client = S3Client::for_bucket(config, bucket).await?;
        Ok(Self {
            config: config.clone(),
            clients: Mutex::new(HashMap::from([(bucket.to_string(), client)])),
            max_keys: None,
        })
    }

    /// Cap the number of candidates returned per listing
    pub fn with_max_keys(mut self, max_keys: Option<usize>) -> Self {
        self.max_keys = max_keys;
        self
    }

    async fn client_for(&self, bucket: &str) -> Result<S3Client, StorageError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(bucket) {
            return Ok(client.clone());
        }

        let client = self.client_for(bucket).await?;
        clients.insert(bucket.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl DiscoverySource for S3DiscoverySource {
    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, DiscoveryError> {
        let client = S3Client::for_bucket(&self.config, bucket).await?;
        let objects = client.list_objects(prefix).await?;
        let keys = order_candidates(objects, self.max_keys);
        debug!(count = keys.len(), "Candidate keys discovered");
        Ok(keys)
    }
}

/// Drop directory placeholders, sort oldest first (ties by key), apply the cap.
///
/// S3 reports `last_modified` in a fixed-width UTC format, so string order is
/// chronological order.
pub fn order_candidates(mut objects: Vec<ObjectSummary>, max_keys: Option<usize>) -> Vec<String> {
    objects.retain(|object| !object.key.ends_with('/'));
    objects.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    });

    let keys = objects.into_iter().map(|object| object.key);
    match max_keys {
        Some(limit) => keys.take(limit).collect(),
        None => keys.collect(),
    }
}
