use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use super::SecureStore;
use crate::error::{StorageError, StorageResult};

/// OS keychain backed store.
///
/// The namespace becomes the keychain service and the key becomes the
/// account, so entries show up as `<namespace>/<key>` in keychain tools.
/// `keyring` calls block, so each operation runs on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(namespace: &str, key: &str) -> StorageResult<Entry> {
        Entry::new(namespace, key).map_err(StorageError::storage_failed)
    }

    async fn blocking<T, F>(f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StorageResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(StorageError::storage_failed)?
    }
}

#[async_trait]
impl SecureStore for KeyringStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        debug!(namespace, key, "Reading keychain entry");
        let entry = Self::entry(namespace, key)?;
        Self::blocking(move || match entry.get_secret() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::storage_failed(e)),
        })
        .await
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        debug!(namespace, key, "Writing keychain entry");
        let entry = Self::entry(namespace, key)?;
        let value = value.to_vec();
        Self::blocking(move || entry.set_secret(&value).map_err(StorageError::storage_failed))
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        debug!(namespace, key, "Deleting keychain entry");
        let entry = Self::entry(namespace, key)?;
        Self::blocking(move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::storage_failed(e)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMESPACE: &str = "com.loyalty.keychain-test";

    // Needs a real keychain (macOS Keychain, Windows Credential Manager or a
    // Secret Service daemon). Run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_keychain_round_trip() {
        let store = KeyringStore::new();
        let key = format!("round-trip-{}", std::process::id());

        store.set(NAMESPACE, &key, b"v1").await.unwrap();
        assert_eq!(store.get(NAMESPACE, &key).await.unwrap(), Some(b"v1".to_vec()));

        // A separate store value reads the same entry
        assert_eq!(
            KeyringStore::new().get(NAMESPACE, &key).await.unwrap(),
            Some(b"v1".to_vec())
        );

        store.delete(NAMESPACE, &key).await.unwrap();
        assert_eq!(store.get(NAMESPACE, &key).await.unwrap(), None);
        store.delete(NAMESPACE, &key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_missing_entry_reads_none() {
        let store = KeyringStore::new();
        assert_eq!(store.get(NAMESPACE, "never-written").await.unwrap(), None);
    }
}
