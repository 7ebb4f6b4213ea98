use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::SecureStore;
use crate::error::{StorageError, StorageResult};

/// In-memory store. Contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all namespaces
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<(String, String), Vec<u8>>) -> T,
    ) -> StorageResult<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::storage_failed(e.to_string()))?;
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.with_entries(|entries| {
            entries
                .get(&(namespace.to_string(), key.to_string()))
                .cloned()
        })
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        self.with_entries(|entries| {
            entries.insert((namespace.to_string(), key.to_string()), value.to_vec());
        })
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        self.with_entries(|entries| {
            entries.remove(&(namespace.to_string(), key.to_string()));
        })
    }
}
