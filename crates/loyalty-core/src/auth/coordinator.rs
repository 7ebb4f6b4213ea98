//! Single-flight credential refresh.
//!
//! Any number of tasks may call [`RefreshCoordinator::refresh`] at once. The
//! first caller starts an attempt; everyone arriving while it runs attaches
//! to it and receives the same outcome. The attempt runs as its own tokio
//! task, so callers that stop waiting do not cancel it for the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::config::RefreshConfig;
use crate::error::{AuthError, RefreshError, RefreshResult};

/// Future returned by a [`TokenProvider`].
pub type TokenFuture = BoxFuture<'static, Result<Option<String>, AuthError>>;

/// Yields the credential currently in use, `None` when there is none.
pub type TokenProvider = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// Future returned by a [`RefreshAction`].
pub type RefreshFuture = BoxFuture<'static, RefreshResult>;

/// Performs one refresh against the authentication server and stores the
/// result. Should write tokens with `Session::update_tokens`.
pub type RefreshAction = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

/// Wrap an async closure as a [`TokenProvider`].
pub fn token_provider<F, Fut>(f: F) -> TokenProvider
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, AuthError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Wrap an async closure as a [`RefreshAction`].
pub fn refresh_action<F, Fut>(f: F) -> RefreshAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = RefreshResult> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

struct InFlight {
    id: u64,
    outcome: Shared<RefreshFuture>,
}

struct Inner {
    token_provider: TokenProvider,
    refresh_action: RefreshAction,
    config: RefreshConfig,
    in_flight: Mutex<Option<InFlight>>,
    next_attempt: AtomicU64,
    attempts_started: AtomicU64,
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self) -> RefreshResult {
        match (self.token_provider)().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("No credential to refresh");
                return Err(RefreshError::TokenNotAvailable);
            }
            Err(e) => return Err(RefreshError::RefreshFailed(e.to_string())),
        }

        let max_retries = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_retries {
            match (self.refresh_action)().await {
                Ok(()) => {
                    info!(attempt = attempt + 1, "Credential refreshed");
                    return Ok(());
                }
                Err(RefreshError::TokenNotAvailable) => {
                    debug!("Credential disappeared during refresh");
                    return Err(RefreshError::TokenNotAvailable);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "Credential refresh attempt failed"
                    );
                    last_error = Some(e);

                    if attempt + 1 < max_retries {
                        tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        match last_error {
            Some(e) if max_retries == 1 => Err(e),
            _ => Err(RefreshError::MaxRetriesExceeded(max_retries)),
        }
    }

    /// Clear the marker for attempt `id`, leaving any newer attempt alone.
    fn finish(&self, id: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.as_ref().is_some_and(|attempt| attempt.id == id) {
            *in_flight = None;
        }
    }
}

/// Clears the in-flight marker when the attempt task ends, even by panic.
struct FinishGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.inner.finish(self.id);
    }
}

/// Deduplicates concurrent refresh requests.
/// Clone is cheap and clones share the same in-flight attempt.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(token_provider: TokenProvider, refresh_action: RefreshAction) -> Self {
        Self::with_config(token_provider, refresh_action, RefreshConfig::default())
    }

    pub fn with_config(
        token_provider: TokenProvider,
        refresh_action: RefreshAction,
        config: RefreshConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token_provider,
                refresh_action,
                config,
                in_flight: Mutex::new(None),
                next_attempt: AtomicU64::new(0),
                attempts_started: AtomicU64::new(0),
            }),
        }
    }

    /// Refresh the credential, or wait for the refresh already running.
    pub async fn refresh(&self) -> RefreshResult {
        self.attach_or_start().await
    }

    /// True while an attempt is running
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_in_flight().is_some()
    }

    /// Number of attempts started over the coordinator's lifetime
    pub fn attempts_started(&self) -> u64 {
        self.inner.attempts_started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.inner.config
    }

    fn attach_or_start(&self) -> Shared<RefreshFuture> {
        let mut in_flight = self.inner.lock_in_flight();

        if let Some(attempt) = in_flight.as_ref() {
            debug!(attempt = attempt.id, "Attaching to in-flight refresh");
            return attempt.outcome.clone();
        }

        let id = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        self.inner.attempts_started.fetch_add(1, Ordering::SeqCst);
        debug!(attempt = id, "Starting refresh");

        let guard = FinishGuard {
            inner: Arc::clone(&self.inner),
            id,
        };
        // The marker is still locked here, so the task cannot clear it
        // before it has been recorded.
        let handle = tokio::spawn(async move {
            let outcome = guard.inner.run().await;
            drop(guard);
            outcome
        });

        let outcome = async move {
            handle.await.unwrap_or_else(|e| {
                Err(RefreshError::RefreshFailed(format!("refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        *in_flight = Some(InFlight {
            id,
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("config", &self.inner.config)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}
