//! Error types shared by every layer of the client.
//!
//! Each layer reports its own enum. [`Error`] wraps them for callers of the
//! request terminals so a single `?` works from application code.

use thiserror::Error;

/// Boxed cause carried by errors that originate in a collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures while attaching credentials to a request.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No access token available")]
    TokenNotAvailable,

    #[error("Access attempted while unauthenticated")]
    AccessAttemptedWhenUnauthenticated,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// Outcome of a failed refresh attempt.
///
/// Cloned to every caller attached to the same in-flight attempt, so causes
/// are carried as messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No credential available to refresh")]
    TokenNotAvailable,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Token refresh failed after {0} attempts")]
    MaxRetriesExceeded(u32),
}

/// Failures while building, sending or decoding a request.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    RequestFailed(#[source] BoxError),

    #[error("Unexpected status code: {0}")]
    UnexpectedStatusCode(u16),

    #[error("Failed to decode response: {0}")]
    DecodingFailed(String),

    #[error("Response contained no data")]
    NoData,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Failures reported by the session store and its secure storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Secure storage failed: {0}")]
    StorageFailed(#[source] BoxError),

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl StorageError {
    pub fn storage_failed(cause: impl Into<BoxError>) -> Self {
        StorageError::StorageFailed(cause.into())
    }
}

/// Umbrella error returned by request terminals.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    /// True when the user has to sign in again: the authenticator could not
    /// produce credentials, or the server kept rejecting them.
    pub fn is_reauthentication_required(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Transport(TransportError::UnexpectedStatusCode(401))
        )
    }

    /// True when the request never reached the server.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Transport(TransportError::RequestFailed(_)))
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
pub type RefreshResult = std::result::Result<(), RefreshError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length for response bodies echoed into error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reauthentication_required() {
        assert!(Error::from(AuthError::TokenNotAvailable).is_reauthentication_required());
        assert!(Error::from(TransportError::UnexpectedStatusCode(401)).is_reauthentication_required());
        assert!(!Error::from(TransportError::UnexpectedStatusCode(500)).is_reauthentication_required());
        assert!(!Error::from(TransportError::NoData).is_reauthentication_required());
    }

    #[test]
    fn test_connectivity() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(Error::from(TransportError::RequestFailed(Box::new(io))).is_connectivity());
        assert!(!Error::from(AuthError::TokenNotAvailable).is_connectivity());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");

        let long = "x".repeat(600);
        let truncated = truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(500)));
        assert!(truncated.ends_with("(truncated, 600 total bytes)"));
    }

    #[test]
    fn test_truncate_body_respects_char_boundary() {
        let long = "é".repeat(300);
        let truncated = truncate_body(&long);
        assert!(truncated.contains("truncated, 600 total bytes"));
    }
}
