//! Request construction and execution.
//!
//! - `transport`: the `Transport` seam and its reqwest implementation
//! - `executor`: authenticate, send, refresh on 401, retry once
//! - `request`: immutable fluent `ApiRequest` descriptors

mod executor;
mod request;
mod transport;

pub use executor::RequestExecutor;
pub use request::ApiRequest;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
