// Redis client for seen-key persistence and the aggregation sink
// No unwrap(), use #[tracing::instrument], proper error handling

use crate::config::RedisConfig;
use crate::errors::StorageError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, instrument};

/// Redis client wrapper; the connection manager reconnects automatically
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    #[instrument(skip(config), fields(redis_url = %config.url()))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        info!("Connecting to Redis");

        let client = Client::open(config.url().as_str()).map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to connect to Redis: {}", e))
        })?;

        info!("Redis connection established");
        Ok(Self { manager })
    }

    /// Get a connection handle
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Health check - ping Redis
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(StorageError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }

    /// Store a string value under `key`
    #[instrument(skip(self, value))]
    pub async fn put_data(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.get_connection();
        let _: () = conn.set(key, value).await?;
        debug!(key = %key, "Value stored in Redis");
        Ok(())
    }
}
