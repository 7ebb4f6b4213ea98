//! Secure key-value storage for session data.
//!
//! This module provides:
//! - `SecureStore`: the namespaced get/set/delete contract sessions persist through
//! - `KeyringStore`: OS keychain backend via `keyring`
//! - `MemoryStore`: process-local backend for tests and ephemeral sessions
//!
//! Encryption at rest is the backend's responsibility.

pub mod keychain;
pub mod memory;

pub use keychain::KeyringStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Durable, namespaced key to bytes store.
///
/// Implementations must be safe to share between tasks. Errors are reported
/// as [`StorageError::StorageFailed`](crate::StorageError::StorageFailed) and
/// are never retried by callers in this crate.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Retrieve a value, `None` if the key has never been set or was deleted
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store a value, replacing any previous one
    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Delete a value. Deleting a missing key succeeds.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()>;

    /// Check if a key exists
    async fn contains(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Ok(self.get(namespace, key).await?.is_some())
    }
}
