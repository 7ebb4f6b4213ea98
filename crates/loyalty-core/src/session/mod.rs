//! Multi-account session persistence.
//!
//! This module provides:
//! - `Session`: handle to one named session (immutable info + lockable tokens)
//! - `SessionStore`: registry with create/restore/list/remove and an active pointer
//!
//! Payloads are caller-defined and stored as JSON in a `SecureStore`.
//! Sessions never expire on their own; expiry is a policy on top of tokens.

mod handle;
pub mod keys;
mod store;

pub use handle::Session;
pub use keys::SessionKeys;
pub use store::SessionStore;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult};

/// Bounds for session info and token payloads.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<P> Payload for P where P: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub(crate) fn encode<P: Serialize + ?Sized>(value: &P) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::Encoding(e.to_string()))
}

pub(crate) fn decode<P: DeserializeOwned>(bytes: &[u8]) -> StorageResult<P> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Encoding(e.to_string()))
}
