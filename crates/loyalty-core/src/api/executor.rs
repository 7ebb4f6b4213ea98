//! Authenticate, send, and recover from a 401 at most once.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::transport::{HttpRequest, HttpResponse, Transport};
use crate::auth::Authenticator;
use crate::error::{truncate_body, Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Retry,
}

impl Attempt {
    fn as_str(self) -> &'static str {
        match self {
            Attempt::Initial => "initial",
            Attempt::Retry => "retry",
        }
    }
}

/// Runs one logical call.
///
/// The authenticator is applied before every send. A 401 is handed to the
/// authenticator's refresh capability, and after a successful refresh the
/// request is authenticated and sent exactly once more. Everything else is
/// terminal, so the transport sees at most two sends per call.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        Self {
            transport,
            authenticator,
        }
    }

    /// Execute `request`, returning the successful (2xx) response.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.attempt(&request, Attempt::Initial).await?;
        if !response.is_unauthorized() {
            return Self::check_status(response);
        }

        let Some(authenticator) = self.authenticator.as_ref() else {
            debug!(url = %request.url, "Unauthorized without an authenticator");
            return Err(TransportError::UnexpectedStatusCode(StatusCode::UNAUTHORIZED.as_u16()).into());
        };

        match authenticator.handle_unauthorized().await {
            None => {
                debug!(url = %request.url, "Authenticator cannot refresh, unauthorized is final");
                return Err(TransportError::UnexpectedStatusCode(StatusCode::UNAUTHORIZED.as_u16()).into());
            }
            Some(Err(e)) => {
                warn!(url = %request.url, error = %e, "Credential refresh failed, unauthorized is final");
                return Err(TransportError::UnexpectedStatusCode(StatusCode::UNAUTHORIZED.as_u16()).into());
            }
            Some(Ok(())) => {}
        }

        let retried = self.attempt(&request, Attempt::Retry).await?;
        if retried.is_unauthorized() {
            warn!(url = %request.url, "Still unauthorized after refresh");
        }
        Self::check_status(retried)
    }

    async fn attempt(&self, request: &HttpRequest, attempt: Attempt) -> Result<HttpResponse> {
        let prepared = match self.authenticator.as_ref() {
            Some(authenticator) => authenticator.authenticate(request.clone()).await?,
            None => request.clone(),
        };

        debug!(
            attempt = attempt.as_str(),
            method = %prepared.method,
            url = %prepared.url,
            "Executing request"
        );
        Ok(self.transport.send(prepared).await?)
    }

    fn check_status(response: HttpResponse) -> Result<HttpResponse> {
        if response.is_success() {
            return Ok(response);
        }
        debug!(
            status = %response.status,
            body = %truncate_body(&response.text()),
            "Request returned an error status"
        );
        Err(TransportError::UnexpectedStatusCode(response.status.as_u16()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{refresh_action, token_provider, AutoRefresh, StaticBearer, Unauthenticated};
    use crate::config::RefreshConfig;
    use crate::error::{AuthError, Error, RefreshError, TransportResult};
    use async_trait::async_trait;
    use reqwest::{Method, Url};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed list of statuses and records what it was sent.
    struct ScriptedTransport {
        statuses: Mutex<Vec<StatusCode>>,
        sent: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(statuses: &[StatusCode]) -> Arc<Self> {
            let mut statuses = statuses.to_vec();
            statuses.reverse();
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sends(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn authorizations(&self) -> Vec<Option<String>> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.authorization().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
            self.sent.lock().unwrap().push(request);
            let status = self.statuses.lock().unwrap().pop().unwrap_or(StatusCode::OK);
            Ok(HttpResponse::new(status, b"{}".to_vec()))
        }
    }

    struct OfflineTransport;

    #[async_trait]
    impl Transport for OfflineTransport {
        async fn send(&self, _request: HttpRequest) -> TransportResult<HttpResponse> {
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "offline");
            Err(TransportError::RequestFailed(Box::new(io)))
        }
    }

    fn request() -> HttpRequest {
        HttpRequest::new(Method::GET, Url::parse("https://example.com/rewards").unwrap())
    }

    /// AutoRefresh whose token switches from a1 to a2 once refreshed.
    fn rotating_auto_refresh(refreshes: Arc<AtomicUsize>, succeed: bool) -> AutoRefresh {
        let token_refreshes = Arc::clone(&refreshes);
        AutoRefresh::with_refresh(
            token_provider(move || {
                let refreshed = token_refreshes.load(Ordering::SeqCst) > 0;
                async move { Ok(Some(if refreshed { "a2" } else { "a1" }.to_string())) }
            }),
            refresh_action(move || {
                let refreshes = Arc::clone(&refreshes);
                async move {
                    if succeed {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    } else {
                        Err(RefreshError::RefreshFailed("invalid_grant".to_string()))
                    }
                }
            }),
            RefreshConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_success_without_retry() {
        let transport = ScriptedTransport::new(&[StatusCode::OK]);
        let executor = RequestExecutor::new(transport.clone(), Some(Arc::new(StaticBearer::fixed("t"))));

        let response = executor.execute(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.sends(), 1);
        assert_eq!(transport.authorizations(), vec![Some("Bearer t".to_string())]);
    }

    #[tokio::test]
    async fn test_no_authenticator_sends_plain_request() {
        let transport = ScriptedTransport::new(&[StatusCode::OK]);
        let executor = RequestExecutor::new(transport.clone(), None);

        executor.execute(request()).await.unwrap();
        assert_eq!(transport.authorizations(), vec![None]);
    }

    #[tokio::test]
    async fn test_unauthorized_without_refresh_capability_is_terminal() {
        let transport = ScriptedTransport::new(&[StatusCode::UNAUTHORIZED, StatusCode::OK]);
        let executor = RequestExecutor::new(transport.clone(), Some(Arc::new(StaticBearer::fixed("t"))));

        let result = executor.execute(request()).await;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::UnexpectedStatusCode(401)))
        ));
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn test_authentication_failure_is_terminal() {
        let transport = ScriptedTransport::new(&[StatusCode::OK]);
        let executor = RequestExecutor::new(transport.clone(), Some(Arc::new(Unauthenticated)));

        let result = executor.execute(request()).await;
        assert!(matches!(
            result,
            Err(Error::Auth(AuthError::AccessAttemptedWhenUnauthenticated))
        ));
        assert_eq!(transport.sends(), 0);
    }

    #[tokio::test]
    async fn test_refresh_then_retry_once() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport::new(&[StatusCode::UNAUTHORIZED, StatusCode::OK]);
        let executor = RequestExecutor::new(
            transport.clone(),
            Some(Arc::new(rotating_auto_refresh(Arc::clone(&refreshes), true))),
        );

        executor.execute(request()).await.unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.authorizations(),
            vec![Some("Bearer a1".to_string()), Some("Bearer a2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_at_most_one_retry() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport::new(&[
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
        ]);
        let executor = RequestExecutor::new(
            transport.clone(),
            Some(Arc::new(rotating_auto_refresh(Arc::clone(&refreshes), true))),
        );

        let result = executor.execute(request()).await;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::UnexpectedStatusCode(401)))
        ));
        assert_eq!(transport.sends(), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_unauthorized() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport::new(&[StatusCode::UNAUTHORIZED, StatusCode::OK]);
        let executor = RequestExecutor::new(
            transport.clone(),
            Some(Arc::new(rotating_auto_refresh(refreshes, false))),
        );

        let result = executor.execute(request()).await;
        assert!(result.as_ref().is_err_and(Error::is_reauthentication_required));
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn test_other_statuses_are_terminal() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport::new(&[StatusCode::INTERNAL_SERVER_ERROR]);
        let executor = RequestExecutor::new(
            transport.clone(),
            Some(Arc::new(rotating_auto_refresh(Arc::clone(&refreshes), true))),
        );

        let result = executor.execute(request()).await;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::UnexpectedStatusCode(500)))
        ));
        assert_eq!(transport.sends(), 1);
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connectivity_failure_is_not_retried() {
        let executor = RequestExecutor::new(Arc::new(OfflineTransport), Some(Arc::new(StaticBearer::fixed("t"))));
        let result = executor.execute(request()).await;
        assert!(result.as_ref().is_err_and(Error::is_connectivity));
    }
}
