// Redis-backed seen-key store
//
// Keys live in a single hash: field = discovered key, value = first-seen
// timestamp (RFC 3339). HSETNX gives the atomic per-key insert.

use super::SeenKeyStore;
use crate::errors::SeenKeyError;
use crate::models::SeenKeyEntry;
use crate::storage::RedisClient;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Default Redis hash holding seen keys
pub const DEFAULT_SEEN_KEYS_HASH: &str = "sensor:seen_keys";

pub struct RedisSeenKeyStore {
    client: RedisClient,
    hash_key: String,
}

impl RedisSeenKeyStore {
    pub fn new(client: RedisClient, hash_key: impl Into<String>) -> Self {
        Self {
            client,
            hash_key: hash_key.into(),
        }
    }

    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }
}

fn redis_err(e: redis::RedisError) -> SeenKeyError {
    SeenKeyError::Storage(format!("Redis error: {}", e))
}

#[async_trait]
impl SeenKeyStore for RedisSeenKeyStore {
    async fn has(&self, key: &str) -> Result<bool, SeenKeyError> {
        let mut conn = self.client.get_connection();
        conn.hexists(&self.hash_key, key).await.map_err(redis_err)
    }

    #[instrument(skip(self), fields(hash = %self.hash_key))]
    async fn record(&self, key: &str) -> Result<SeenKeyEntry, SeenKeyError> {
        let mut conn = self.client.get_connection();
        let entry = SeenKeyEntry::now(key);

        let inserted: bool = conn
            .hset_nx(&self.hash_key, key, entry.first_seen_at.to_rfc3339())
            .await
            .map_err(redis_err)?;

        if !inserted {
            return Err(SeenKeyError::DuplicateKey(key.to_string()));
        }

        debug!(key = %key, "Seen key recorded");
        Ok(entry)
    }

    async fn all_keys(&self) -> Result<HashSet<String>, SeenKeyError> {
        let mut conn = self.client.get_connection();
        let keys: Vec<String> = conn.hkeys(&self.hash_key).await.map_err(redis_err)?;
        Ok(keys.into_iter().collect())
    }
}
