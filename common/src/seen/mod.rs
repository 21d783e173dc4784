// Seen-key tracking for discovery sensors
//
// Guarantees at-most-once triggering per discovered key. Entries are never
// evicted.

pub mod file;
pub mod memory;
pub mod redis;

use crate::errors::SeenKeyError;
use crate::models::SeenKeyEntry;
use async_trait::async_trait;
use std::collections::HashSet;

pub use file::FileSeenKeyStore;
pub use memory::InMemorySeenKeyStore;
pub use self::redis::RedisSeenKeyStore;

/// SeenKeyStore trait; implementations must make `record` an atomic per-key insert
#[async_trait]
pub trait SeenKeyStore: Send + Sync {
    /// Whether the key has already produced a run request
    async fn has(&self, key: &str) -> Result<bool, SeenKeyError>;

    /// Record a key; fails with `SeenKeyError::DuplicateKey` if already present
    async fn record(&self, key: &str) -> Result<SeenKeyEntry, SeenKeyError>;

    /// Snapshot of all recorded keys
    async fn all_keys(&self) -> Result<HashSet<String>, SeenKeyError>;
}
