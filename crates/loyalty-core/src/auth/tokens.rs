//! Bearer token payloads and the glue between sessions and authenticators.

use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::authenticator::AutoRefresh;
use super::coordinator::{refresh_action, token_provider, RefreshAction, TokenProvider};
use crate::api::{ApiRequest, Transport};
use crate::config::RefreshConfig;
use crate::error::{AuthError, Error, RefreshError};
use crate::session::{Payload, Session};

/// A token payload that carries a bearer access token.
pub trait BearerToken {
    fn access_token(&self) -> &str;

    fn refresh_token(&self) -> Option<&str> {
        None
    }
}

/// Access and refresh token as issued by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl BearerToken for TokenPair {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn refresh_token(&self) -> Option<&str> {
        Some(&self.refresh_token)
    }
}

/// Read the access token from `session` on every call.
pub fn session_token_provider<I, T>(session: Session<I, T>) -> TokenProvider
where
    I: Payload,
    T: Payload + Clone + BearerToken,
{
    token_provider(move || {
        let session = session.clone();
        async move {
            let tokens = session
                .get_tokens()
                .await
                .map_err(|e| AuthError::AuthenticationFailed(e.to_string()))?;
            Ok(tokens.map(|tokens| tokens.access_token().to_string()))
        }
    })
}

impl AutoRefresh {
    /// Authenticate with the session's access token and refresh it with
    /// `action`.
    pub fn for_session<I, T>(session: Session<I, T>, action: RefreshAction, config: RefreshConfig) -> Self
    where
        I: Payload,
        T: Payload + Clone + BearerToken,
    {
        Self::with_refresh(session_token_provider(session), action, config)
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    /// Absent when the server does not rotate refresh tokens
    refresh_token: Option<String>,
}

/// Refresh action that trades the session's refresh token at
/// `base_url`/`path` for a new access token.
///
/// The exchange is sent without an authenticator. The result is written with
/// `update_tokens` and only replaces the pair the exchange started from, so
/// tokens that were cleared or replaced meanwhile stay as they are.
pub fn token_endpoint_refresh<I: Payload>(
    transport: Arc<dyn Transport>,
    base_url: Url,
    path: &str,
    session: Session<I, TokenPair>,
) -> RefreshAction {
    let endpoint = ApiRequest::new(transport, base_url).post(Some(path));

    refresh_action(move || {
        let endpoint = endpoint.clone();
        let session = session.clone();
        async move {
            let current = session
                .get_tokens()
                .await
                .map_err(|e| RefreshError::RefreshFailed(e.to_string()))?
                .ok_or(RefreshError::TokenNotAvailable)?;

            let issued: RefreshResponse = endpoint
                .body(&RefreshRequest {
                    refresh_token: &current.refresh_token,
                })
                .call_decoded()
                .await
                .map_err(|e: Error| RefreshError::RefreshFailed(e.to_string()))?;

            let issued_access = issued.access_token.clone();
            let used = current.refresh_token;
            let stored = session
                .update_tokens(move |tokens| match tokens {
                    Some(tokens) if tokens.refresh_token == used => Some(TokenPair {
                        access_token: issued.access_token,
                        refresh_token: issued.refresh_token.unwrap_or(used),
                    }),
                    other => other,
                })
                .await
                .map_err(|e| RefreshError::RefreshFailed(e.to_string()))?;

            match stored {
                Some(tokens) if tokens.access_token == issued_access => {
                    info!(session = session.id(), "Stored refreshed tokens");
                    Ok(())
                }
                Some(_) => {
                    debug!(
                        session = session.id(),
                        "Tokens replaced during refresh, discarding exchange result"
                    );
                    Ok(())
                }
                None => {
                    debug!(session = session.id(), "Tokens cleared during refresh");
                    Err(RefreshError::TokenNotAvailable)
                }
            }
        }
    })
}
