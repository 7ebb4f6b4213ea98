use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use super::coordinator::{RefreshAction, RefreshCoordinator, TokenProvider};
use crate::api::HttpRequest;
use crate::config::RefreshConfig;
use crate::error::{AuthError, AuthResult, RefreshResult};

/// Attaches credentials to outgoing requests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Return `request` with credentials applied.
    async fn authenticate(&self, request: HttpRequest) -> AuthResult<HttpRequest>;

    /// Try to recover from a 401.
    ///
    /// `None` means this authenticator cannot refresh credentials, so the
    /// 401 is final. `Some(Ok(()))` means fresh credentials are in place and
    /// the request may be sent once more.
    async fn handle_unauthorized(&self) -> Option<RefreshResult> {
        None
    }
}

async fn apply_bearer(token: &TokenProvider, request: HttpRequest) -> AuthResult<HttpRequest> {
    match (token)().await? {
        Some(token) => request.with_bearer(&token),
        None => Err(AuthError::TokenNotAvailable),
    }
}

/// Refuses every request. Install it while logged out so protected calls
/// fail locally instead of going to the server for a 401.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unauthenticated;

#[async_trait]
impl Authenticator for Unauthenticated {
    async fn authenticate(&self, _request: HttpRequest) -> AuthResult<HttpRequest> {
        Err(AuthError::AccessAttemptedWhenUnauthenticated)
    }
}

/// Sends whatever token the accessor yields as a bearer token.
pub struct StaticBearer {
    token: TokenProvider,
}

impl StaticBearer {
    pub fn new(token: TokenProvider) -> Self {
        Self { token }
    }

    /// Always send `token`.
    pub fn fixed(token: impl Into<String>) -> Self {
        let token: Arc<str> = Arc::from(token.into());
        Self::new(Arc::new(move || {
            let token = Arc::clone(&token);
            async move { Ok(Some(token.to_string())) }.boxed()
        }))
    }
}

#[async_trait]
impl Authenticator for StaticBearer {
    async fn authenticate(&self, request: HttpRequest) -> AuthResult<HttpRequest> {
        apply_bearer(&self.token, request).await
    }
}

/// Forwards to a delegate that can be replaced at runtime, e.g. on login
/// and logout, without rebuilding everything that holds the proxy.
pub struct Proxy {
    current: Mutex<Arc<dyn Authenticator>>,
}

impl Proxy {
    pub fn new(initial: Arc<dyn Authenticator>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// A proxy that starts out logged out
    pub fn unauthenticated() -> Self {
        Self::new(Arc::new(Unauthenticated))
    }

    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) {
        debug!("Swapping proxy authenticator");
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = authenticator;
    }

    pub fn current(&self) -> Arc<dyn Authenticator> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

#[async_trait]
impl Authenticator for Proxy {
    async fn authenticate(&self, request: HttpRequest) -> AuthResult<HttpRequest> {
        // The lock is released before awaiting the delegate
        let delegate = self.current();
        delegate.authenticate(request).await
    }

    async fn handle_unauthorized(&self) -> Option<RefreshResult> {
        let delegate = self.current();
        delegate.handle_unauthorized().await
    }
}

/// Bearer authentication that can recover from a 401 by refreshing the
/// credential through a shared [`RefreshCoordinator`].
pub struct AutoRefresh {
    token: TokenProvider,
    coordinator: RefreshCoordinator,
}

impl AutoRefresh {
    pub fn new(token: TokenProvider, coordinator: RefreshCoordinator) -> Self {
        Self { token, coordinator }
    }

    /// Build the coordinator too, using `token` as its credential check.
    pub fn with_refresh(token: TokenProvider, action: RefreshAction, config: RefreshConfig) -> Self {
        let coordinator = RefreshCoordinator::with_config(Arc::clone(&token), action, config);
        Self::new(token, coordinator)
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}

#[async_trait]
impl Authenticator for AutoRefresh {
    async fn authenticate(&self, request: HttpRequest) -> AuthResult<HttpRequest> {
        apply_bearer(&self.token, request).await
    }

    async fn handle_unauthorized(&self) -> Option<RefreshResult> {
        debug!("Unauthorized response, refreshing credential");
        Some(self.coordinator.refresh().await)
    }
}
