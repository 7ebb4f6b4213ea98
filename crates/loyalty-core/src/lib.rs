//! Authenticated API access and multi-account session storage.
//!
//! The crate is organized in layers:
//! - `storage`: the `SecureStore` key/value seam (OS keychain, in-memory)
//! - `session`: named sessions with atomic token updates and an active pointer
//! - `auth`: authenticators and single-flight credential refresh
//! - `api`: request descriptors and the retry-on-401 executor
//! - `config`: client configuration loaded from disk and the environment

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod session;
pub mod storage;

pub use api::{ApiRequest, RequestExecutor, ReqwestTransport, Transport};
pub use auth::{Authenticator, AutoRefresh, Proxy, RefreshCoordinator, StaticBearer, TokenPair, Unauthenticated};
pub use config::{ClientConfig, RefreshConfig};
pub use error::{AuthError, Error, RefreshError, Result, StorageError, TransportError};
pub use session::{Session, SessionStore};
pub use storage::{KeyringStore, MemoryStore, SecureStore};
