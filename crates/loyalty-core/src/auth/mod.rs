//! Authenticators and single-flight credential refresh.
//!
//! An [`Authenticator`] decorates outgoing requests and, optionally, knows how
//! to recover from a 401. [`AutoRefresh`] does the latter through a
//! [`RefreshCoordinator`] so that concurrent 401s trigger one refresh.

mod authenticator;
mod coordinator;
mod tokens;

pub use authenticator::{Authenticator, AutoRefresh, Proxy, StaticBearer, Unauthenticated};
pub use coordinator::{
    refresh_action, token_provider, RefreshAction, RefreshCoordinator, RefreshFuture, TokenFuture,
    TokenProvider,
};
pub use tokens::{session_token_provider, token_endpoint_refresh, BearerToken, TokenPair};
