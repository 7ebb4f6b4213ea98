//! Immutable, fluent request descriptors.
//!
//! Every configuration call returns a new `ApiRequest`; the receiver is never
//! modified, so a descriptor can be shared between tasks and specialized
//! freely:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use loyalty_core::api::{ApiRequest, ReqwestTransport};
//! # async fn demo(transport: Arc<ReqwestTransport>, base: reqwest::Url) -> loyalty_core::Result<()> {
//! let api = ApiRequest::new(transport, base);
//! let rewards: Vec<serde_json::Value> = api
//!     .get(Some("rewards"))
//!     .parameter("page", Some("2"))
//!     .call_data()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::executor::RequestExecutor;
use super::transport::{HttpRequest, HttpResponse, Transport};
use crate::auth::Authenticator;
use crate::error::{Result, TransportError, TransportResult};

const JSON: &str = "application/json";

#[derive(Debug, Clone)]
enum RequestBody {
    Empty,
    Json(Arc<[u8]>),
    /// Serialization failed; reported when the request is built
    Invalid(String),
}

/// `{ "data": ... }` envelope used by list and detail endpoints
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Option<T>,
}

#[derive(Clone)]
pub struct ApiRequest {
    transport: Arc<dyn Transport>,
    base_url: Url,
    method: Method,
    segments: Vec<String>,
    parameters: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ApiRequest {
    /// A GET of `base_url` with no authenticator.
    pub fn new(transport: Arc<dyn Transport>, base_url: Url) -> Self {
        Self {
            transport,
            base_url,
            method: Method::GET,
            segments: Vec::new(),
            parameters: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            authenticator: None,
        }
    }

    /// Append path segments. Slashes separate segments; each segment is
    /// percent-encoded.
    pub fn path(&self, path: &str) -> Self {
        let mut next = self.clone();
        next.segments.extend(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        );
        next
    }

    pub fn method(&self, method: Method) -> Self {
        let mut next = self.clone();
        next.method = method;
        next
    }

    pub fn get(&self, path: Option<&str>) -> Self {
        self.with_method(Method::GET, path)
    }

    pub fn post(&self, path: Option<&str>) -> Self {
        self.with_method(Method::POST, path)
    }

    pub fn put(&self, path: Option<&str>) -> Self {
        self.with_method(Method::PUT, path)
    }

    pub fn delete(&self, path: Option<&str>) -> Self {
        self.with_method(Method::DELETE, path)
    }

    pub fn patch(&self, path: Option<&str>) -> Self {
        self.with_method(Method::PATCH, path)
    }

    /// Set a query parameter, replacing earlier values for `key`.
    /// `None` removes the parameter.
    pub fn parameter(&self, key: &str, value: Option<&str>) -> Self {
        let mut next = self.clone();
        next.parameters.retain(|(existing, _)| existing != key);
        if let Some(value) = value {
            next.parameters.push((key.to_string(), value.to_string()));
        }
        next
    }

    pub fn header(&self, name: HeaderName, value: HeaderValue) -> Self {
        let mut next = self.clone();
        next.headers.insert(name, value);
        next
    }

    /// Send `body` as JSON.
    pub fn body<B: Serialize + ?Sized>(&self, body: &B) -> Self {
        let mut next = self.clone();
        next.body = match serde_json::to_vec(body) {
            Ok(bytes) => RequestBody::Json(Arc::from(bytes)),
            Err(e) => RequestBody::Invalid(e.to_string()),
        };
        next
    }

    pub fn authenticate(&self, authenticator: Arc<dyn Authenticator>) -> Self {
        let mut next = self.clone();
        next.authenticator = Some(authenticator);
        next
    }

    /// Assemble the request without sending it.
    pub fn build(&self) -> TransportResult<HttpRequest> {
        let mut url = self.base_url.clone();
        if url.cannot_be_a_base() {
            return Err(TransportError::InvalidRequest(format!(
                "{} cannot be a base URL",
                self.base_url
            )));
        }
        if !self.segments.is_empty() {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().extend(&self.segments);
            }
        }
        if !self.parameters.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.parameters);
        }

        let mut request = HttpRequest::new(self.method.clone(), url);
        request.headers = self.headers.clone();
        if !request.headers.contains_key(ACCEPT) {
            request.headers.insert(ACCEPT, HeaderValue::from_static(JSON));
        }

        match &self.body {
            RequestBody::Empty => {}
            RequestBody::Json(bytes) => {
                request.headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
                request.body = Some(bytes.to_vec());
            }
            RequestBody::Invalid(reason) => {
                return Err(TransportError::InvalidRequest(format!(
                    "body could not be encoded: {}",
                    reason
                )));
            }
        }

        Ok(request)
    }

    /// Execute and return the successful response.
    pub async fn send(&self) -> Result<HttpResponse> {
        let request = self.build()?;
        RequestExecutor::new(Arc::clone(&self.transport), self.authenticator.clone())
            .execute(request)
            .await
    }

    /// Execute, ignoring the response body.
    pub async fn call(&self) -> Result<()> {
        self.send().await.map(|_| ())
    }

    /// Execute and decode the response body.
    pub async fn call_decoded<T: DeserializeOwned>(&self) -> Result<T> {
        let response = self.send().await?;
        Ok(decode_body(&response)?)
    }

    /// Execute and decode the `data` member of a `{ "data": ... }` envelope.
    pub async fn call_data<T: DeserializeOwned>(&self) -> Result<T> {
        let response = self.send().await?;
        let envelope: DataEnvelope<T> = decode_body(&response)?;
        Ok(envelope.data.ok_or(TransportError::NoData)?)
    }

    fn with_method(&self, method: Method, path: Option<&str>) -> Self {
        let next = self.method(method);
        match path {
            Some(path) => next.path(path),
            None => next,
        }
    }
}

impl std::fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("base_url", &self.base_url.as_str())
            .field("segments", &self.segments)
            .field("parameters", &self.parameters)
            .field("authenticated", &self.authenticator.is_some())
            .finish()
    }
}

fn decode_body<T: DeserializeOwned>(response: &HttpResponse) -> TransportResult<T> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Err(TransportError::NoData);
    }
    serde_json::from_slice(&response.body).map_err(|e| TransportError::DecodingFailed(e.to_string()))
}
