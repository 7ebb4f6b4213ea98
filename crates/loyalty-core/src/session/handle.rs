use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::keys::SessionKeys;
use super::{decode, encode, Payload};
use crate::error::{StorageError, StorageResult};
use crate::storage::SecureStore;

enum TokenSlot<T> {
    /// Not read from storage yet
    Unloaded,
    Loaded(Option<T>),
    /// The session was removed from its store
    Removed,
}

struct Inner<I, T> {
    id: String,
    info: I,
    store: Arc<dyn SecureStore>,
    namespace: Arc<str>,
    tokens: Mutex<TokenSlot<T>>,
}

/// Handle to one persisted session.
///
/// Clones share state. Token reads and writes on a session are serialized by
/// a lock that is held across the storage write, so
/// [`update_tokens`](Session::update_tokens) is atomic with respect to
/// [`get_tokens`](Session::get_tokens) and [`set_tokens`](Session::set_tokens).
pub struct Session<I, T> {
    inner: Arc<Inner<I, T>>,
}

impl<I, T> Clone for Session<I, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, T> std::fmt::Debug for Session<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.inner.id).finish()
    }
}

impl<I, T> Session<I, T>
where
    I: Payload,
    T: Payload + Clone,
{
    /// Handle for a session that was just written, tokens already known.
    pub(crate) fn created(
        id: String,
        info: I,
        tokens: Option<T>,
        store: Arc<dyn SecureStore>,
        namespace: Arc<str>,
    ) -> Self {
        Self::with_slot(id, info, TokenSlot::Loaded(tokens), store, namespace)
    }

    /// Handle for a session read back from storage, tokens loaded lazily.
    pub(crate) fn restored(
        id: String,
        info: I,
        store: Arc<dyn SecureStore>,
        namespace: Arc<str>,
    ) -> Self {
        Self::with_slot(id, info, TokenSlot::Unloaded, store, namespace)
    }

    fn with_slot(
        id: String,
        info: I,
        slot: TokenSlot<T>,
        store: Arc<dyn SecureStore>,
        namespace: Arc<str>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                info,
                store,
                namespace,
                tokens: Mutex::new(slot),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn info(&self) -> &I {
        &self.inner.info
    }

    /// Current tokens, reading them from storage on first use.
    /// A removed session has no tokens.
    pub async fn get_tokens(&self) -> StorageResult<Option<T>> {
        let mut slot = self.inner.tokens.lock().await;
        self.load(&mut slot).await?;
        Ok(match &*slot {
            TokenSlot::Loaded(tokens) => tokens.clone(),
            TokenSlot::Unloaded | TokenSlot::Removed => None,
        })
    }

    /// Replace the tokens. `None` deletes them from storage.
    pub async fn set_tokens(&self, tokens: Option<T>) -> StorageResult<()> {
        let mut slot = self.inner.tokens.lock().await;
        self.ensure_live(&slot)?;
        // Reload from storage if the write is cancelled or fails midway
        *slot = TokenSlot::Unloaded;
        self.persist(tokens.as_ref()).await?;
        *slot = TokenSlot::Loaded(tokens);
        Ok(())
    }

    /// Atomically read, transform and write the tokens, returning the new
    /// value. If the write fails, the next read comes from storage.
    ///
    /// Refresh actions should store rotated tokens through this so a refresh
    /// racing a logout cannot bring the tokens back.
    pub async fn update_tokens<F>(&self, transform: F) -> StorageResult<Option<T>>
    where
        F: FnOnce(Option<T>) -> Option<T> + Send,
    {
        let mut slot = self.inner.tokens.lock().await;
        self.ensure_live(&slot)?;
        self.load(&mut slot).await?;

        let current = match &*slot {
            TokenSlot::Loaded(tokens) => tokens.clone(),
            TokenSlot::Unloaded | TokenSlot::Removed => None,
        };
        let next = transform(current);

        *slot = TokenSlot::Unloaded;
        self.persist(next.as_ref()).await?;
        *slot = TokenSlot::Loaded(next.clone());
        Ok(next)
    }

    pub async fn clear_tokens(&self) -> StorageResult<()> {
        self.set_tokens(None).await
    }

    pub async fn has_tokens(&self) -> StorageResult<bool> {
        Ok(self.get_tokens().await?.is_some())
    }

    /// Delete both keys and mark every clone of this handle as removed.
    /// Waits for any token write in progress to finish first.
    pub(crate) async fn destroy(&self) -> StorageResult<()> {
        let mut slot = self.inner.tokens.lock().await;
        let store = &self.inner.store;
        *slot = TokenSlot::Unloaded;
        store
            .delete(&self.inner.namespace, &SessionKeys::tokens(&self.inner.id))
            .await?;
        *slot = TokenSlot::Loaded(None);
        store
            .delete(&self.inner.namespace, &SessionKeys::info(&self.inner.id))
            .await?;
        *slot = TokenSlot::Removed;
        Ok(())
    }

    fn ensure_live(&self, slot: &TokenSlot<T>) -> StorageResult<()> {
        match slot {
            TokenSlot::Removed => Err(StorageError::NotFound(self.inner.id.clone())),
            TokenSlot::Unloaded | TokenSlot::Loaded(_) => Ok(()),
        }
    }

    async fn load(&self, slot: &mut TokenSlot<T>) -> StorageResult<()> {
        if let TokenSlot::Unloaded = slot {
            debug!(session_id = %self.inner.id, "Loading session tokens");
            let bytes = self
                .inner
                .store
                .get(&self.inner.namespace, &SessionKeys::tokens(&self.inner.id))
                .await?;
            let tokens = bytes.map(|bytes| decode::<T>(&bytes)).transpose()?;
            *slot = TokenSlot::Loaded(tokens);
        }
        Ok(())
    }

    async fn persist(&self, tokens: Option<&T>) -> StorageResult<()> {
        let key = SessionKeys::tokens(&self.inner.id);
        match tokens {
            Some(tokens) => {
                let bytes = encode(tokens)?;
                self.inner
                    .store
                    .set(&self.inner.namespace, &key, &bytes)
                    .await
            }
            None => self.inner.store.delete(&self.inner.namespace, &key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tokens {
        access: String,
        refresh: String,
    }

    fn tokens(access: &str, refresh: &str) -> Tokens {
        Tokens {
            access: access.to_string(),
            refresh: refresh.to_string(),
        }
    }

    fn session(store: Arc<MemoryStore>) -> Session<String, Tokens> {
        Session::created(
            "s1".to_string(),
            "info".to_string(),
            Some(tokens("a1", "r1")),
            store,
            Arc::from("test"),
        )
    }

    #[tokio::test]
    async fn test_update_tokens_applies_transform() {
        let store = Arc::new(MemoryStore::new());
        let session = session(Arc::clone(&store));

        let updated = session
            .update_tokens(|_| Some(tokens("a2", "r1")))
            .await
            .unwrap();
        assert_eq!(updated, Some(tokens("a2", "r1")));
        assert_eq!(session.get_tokens().await.unwrap(), Some(tokens("a2", "r1")));

        // Persisted as well
        let bytes = store
            .get("test", &SessionKeys::tokens("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode::<Tokens>(&bytes).unwrap(), tokens("a2", "r1"));
    }

    #[tokio::test]
    async fn test_set_none_deletes_tokens() {
        let store = Arc::new(MemoryStore::new());
        let session = session(Arc::clone(&store));
        session.set_tokens(Some(tokens("a1", "r1"))).await.unwrap();

        session.clear_tokens().await.unwrap();
        assert!(!session.has_tokens().await.unwrap());
        assert_eq!(store.get("test", &SessionKeys::tokens("s1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restored_session_loads_tokens_lazily() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("test", &SessionKeys::tokens("s1"), &encode(&tokens("a9", "r9")).unwrap())
            .await
            .unwrap();

        let session: Session<String, Tokens> = Session::restored(
            "s1".to_string(),
            "info".to_string(),
            store.clone(),
            Arc::from("test"),
        );
        assert_eq!(session.get_tokens().await.unwrap(), Some(tokens("a9", "r9")));
    }

    #[tokio::test]
    async fn test_destroyed_session_rejects_writes() {
        let store = Arc::new(MemoryStore::new());
        let session = session(Arc::clone(&store));
        let other_handle = session.clone();

        session.destroy().await.unwrap();

        assert_eq!(other_handle.get_tokens().await.unwrap(), None);
        assert!(matches!(
            other_handle.set_tokens(Some(tokens("a3", "r3"))).await,
            Err(StorageError::NotFound(id)) if id == "s1"
        ));
        assert!(matches!(
            other_handle.update_tokens(|t| t).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(store.get("test", &SessionKeys::tokens("s1")).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let session: Session<String, u64> = Session::created(
            "counter".to_string(),
            String::new(),
            Some(0),
            store,
            Arc::from("test"),
        );

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move {
                    session
                        .update_tokens(|n| Some(n.unwrap_or(0) + 1))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(session.get_tokens().await.unwrap(), Some(50));
    }

    /// Lands every write, then either stalls or reports failure.
    #[derive(Default)]
    struct UnreliableWrites {
        inner: MemoryStore,
        stall: AtomicBool,
    }

    #[async_trait]
    impl SecureStore for UnreliableWrites {
        async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.get(namespace, key).await
        }

        async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
            self.inner.set(namespace, key, value).await?;
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Err(StorageError::storage_failed("acknowledgement lost"))
        }

        async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
            self.inner.delete(namespace, key).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_write_does_not_leave_stale_tokens() {
        let store = Arc::new(UnreliableWrites::default());
        store.stall.store(true, Ordering::SeqCst);
        let session: Session<String, Tokens> = Session::created(
            "s1".to_string(),
            "info".to_string(),
            Some(tokens("a1", "r1")),
            store.clone(),
            Arc::from("test"),
        );

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            session.set_tokens(Some(tokens("a2", "r2"))),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(session.get_tokens().await.unwrap(), Some(tokens("a2", "r2")));
    }

    #[tokio::test]
    async fn test_failed_update_rereads_storage() {
        let store = Arc::new(UnreliableWrites::default());
        let session: Session<String, Tokens> = Session::created(
            "s1".to_string(),
            "info".to_string(),
            Some(tokens("a1", "r1")),
            store.clone(),
            Arc::from("test"),
        );

        let result = session.update_tokens(|_| Some(tokens("a2", "r1"))).await;
        assert!(matches!(result, Err(StorageError::StorageFailed(_))));

        // The cache agrees with whatever storage holds
        let stored = store.inner.get("test", &SessionKeys::tokens("s1")).await.unwrap();
        let stored = stored.map(|bytes| decode::<Tokens>(&bytes).unwrap());
        assert_eq!(session.get_tokens().await.unwrap(), stored);
    }
}
