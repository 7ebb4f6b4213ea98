use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::handle::Session;
use super::keys::SessionKeys;
use super::{decode, encode, Payload};
use crate::error::{StorageError, StorageResult};
use crate::storage::SecureStore;

/// Registry of named sessions persisted in a [`SecureStore`].
///
/// Sessions live under `sessions.<id>.info` and `sessions.<id>.tokens` in
/// the store's namespace. The list of ids and the active pointer are
/// persisted too, so both survive restarts. Registry operations are
/// serialized; token access on each session is locked separately.
pub struct SessionStore<I, T> {
    store: Arc<dyn SecureStore>,
    namespace: Arc<str>,
    sessions: Mutex<HashMap<String, Session<I, T>>>,
}

impl<I, T> SessionStore<I, T>
where
    I: Payload,
    T: Payload + Clone,
{
    pub fn new(store: Arc<dyn SecureStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: Arc::from(namespace.into()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create and persist a new session.
    ///
    /// Fails with [`StorageError::DuplicateSession`] if `id` is already
    /// known, in memory or in storage.
    pub async fn create(&self, id: &str, info: I, tokens: Option<T>) -> StorageResult<Session<I, T>> {
        let mut sessions = self.sessions.lock().await;

        if sessions.contains_key(id) || self.store.contains(&self.namespace, &SessionKeys::info(id)).await? {
            return Err(StorageError::DuplicateSession(id.to_string()));
        }

        self.store
            .set(&self.namespace, &SessionKeys::info(id), &encode(&info)?)
            .await?;

        if let Err(e) = self.finish_create(id, tokens.as_ref()).await {
            // Do not leave behind a session that is neither listed nor loaded
            self.roll_back_create(id).await;
            return Err(e);
        }

        let session = Session::created(
            id.to_string(),
            info,
            tokens,
            Arc::clone(&self.store),
            Arc::clone(&self.namespace),
        );
        sessions.insert(id.to_string(), session.clone());

        info!(session_id = id, "Session created");
        Ok(session)
    }

    /// Load a session by id. Tokens are read on first use.
    pub async fn restore(&self, id: &str) -> StorageResult<Session<I, T>> {
        let mut sessions = self.sessions.lock().await;
        self.restore_locked(&mut sessions, id).await
    }

    /// Make `id` the active session.
    pub async fn set_active(&self, id: &str) -> StorageResult<()> {
        let mut sessions = self.sessions.lock().await;
        self.restore_locked(&mut sessions, id).await?;
        self.store
            .set(&self.namespace, SessionKeys::ACTIVE, id.as_bytes())
            .await?;
        info!(session_id = id, "Active session changed");
        Ok(())
    }

    /// The session the active pointer refers to.
    pub async fn get_active(&self) -> StorageResult<Session<I, T>> {
        let mut sessions = self.sessions.lock().await;
        let id = self
            .read_active()
            .await?
            .ok_or_else(|| StorageError::NotFound("active session".to_string()))?;
        self.restore_locked(&mut sessions, &id).await
    }

    /// Id stored in the active pointer, whether or not that session still exists
    pub async fn active_id(&self) -> StorageResult<Option<String>> {
        let _sessions = self.sessions.lock().await;
        self.read_active().await
    }

    pub async fn clear_active(&self) -> StorageResult<()> {
        let _sessions = self.sessions.lock().await;
        self.store.delete(&self.namespace, SessionKeys::ACTIVE).await
    }

    /// Delete a session's info and tokens. Removing an unknown id succeeds.
    /// Clears the active pointer if it referred to `id`.
    pub async fn remove(&self, id: &str) -> StorageResult<()> {
        let mut sessions = self.sessions.lock().await;

        // Unregister only once the keys are gone; the live handle stays
        // the only one for this id if a delete fails
        match sessions.get(id).cloned() {
            Some(session) => {
                session.destroy().await?;
                sessions.remove(id);
            }
            None => {
                self.store
                    .delete(&self.namespace, &SessionKeys::tokens(id))
                    .await?;
                self.store
                    .delete(&self.namespace, &SessionKeys::info(id))
                    .await?;
            }
        }

        let mut index = self.read_index().await?;
        let before = index.len();
        index.retain(|known| known != id);
        if index.len() != before {
            self.write_index(&index).await?;
        }

        if self.read_active().await?.as_deref() == Some(id) {
            self.store.delete(&self.namespace, SessionKeys::ACTIVE).await?;
            debug!(session_id = id, "Cleared active pointer");
        }

        info!(session_id = id, "Session removed");
        Ok(())
    }

    /// All known sessions, in creation order.
    pub async fn list(&self) -> StorageResult<Vec<Session<I, T>>> {
        let mut sessions = self.sessions.lock().await;
        let index = self.read_index().await?;

        let mut listed = Vec::with_capacity(index.len());
        for id in &index {
            match self.restore_locked(&mut sessions, id).await {
                Ok(session) => listed.push(session),
                Err(StorageError::NotFound(_)) => {
                    warn!(session_id = %id, "Indexed session has no stored info, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(listed)
    }

    pub async fn contains(&self, id: &str) -> StorageResult<bool> {
        let sessions = self.sessions.lock().await;
        if sessions.contains_key(id) {
            return Ok(true);
        }
        self.store.contains(&self.namespace, &SessionKeys::info(id)).await
    }

    async fn restore_locked(
        &self,
        sessions: &mut HashMap<String, Session<I, T>>,
        id: &str,
    ) -> StorageResult<Session<I, T>> {
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }

        let bytes = self
            .store
            .get(&self.namespace, &SessionKeys::info(id))
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let info: I = decode(&bytes)?;

        let session = Session::restored(
            id.to_string(),
            info,
            Arc::clone(&self.store),
            Arc::clone(&self.namespace),
        );
        sessions.insert(id.to_string(), session.clone());

        debug!(session_id = id, "Session restored");
        Ok(session)
    }

    /// Write the tokens and the index entry of a session whose info is stored.
    async fn finish_create(&self, id: &str, tokens: Option<&T>) -> StorageResult<()> {
        if let Some(tokens) = tokens {
            self.store
                .set(&self.namespace, &SessionKeys::tokens(id), &encode(tokens)?)
                .await?;
        }

        let mut index = self.read_index().await?;
        if !index.iter().any(|known| known == id) {
            index.push(id.to_string());
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn roll_back_create(&self, id: &str) {
        for key in [SessionKeys::tokens(id), SessionKeys::info(id)] {
            if let Err(e) = self.store.delete(&self.namespace, &key).await {
                warn!(session_id = id, key = %key, error = %e, "Failed to roll back session");
            }
        }
    }

    async fn read_active(&self) -> StorageResult<Option<String>> {
        let bytes = self.store.get(&self.namespace, SessionKeys::ACTIVE).await?;
        bytes
            .map(|bytes| String::from_utf8(bytes).map_err(|e| StorageError::Encoding(e.to_string())))
            .transpose()
    }

    async fn read_index(&self) -> StorageResult<Vec<String>> {
        match self.store.get(&self.namespace, SessionKeys::INDEX).await? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, index: &[String]) -> StorageResult<()> {
        self.store
            .set(&self.namespace, SessionKeys::INDEX, &encode(&index)?)
            .await
    }
}
