//! # PwaKit Net
//!
//! Request/response model, origin checks and the network fetch capability
//! used by the offline asset worker.
//!
//! ## Design Goals
//!
//! 1. **Injectable network**: the worker talks to the network only through
//!    the [`Fetcher`] trait, so cache policy can be tested without sockets
//! 2. **Single-use bodies**: a [`Response`] body can be read once; copies are
//!    made explicitly with [`Response::try_clone`]
//! 3. **Async HTTP**: [`ResourceLoader`] is the `reqwest`-backed fetcher

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod loader;
pub mod origin;

pub use loader::{LoaderConfig, ResourceLoader};
pub use origin::Origin;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Response body already used")]
    BodyUsed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring `Request.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Subresource load without CORS.
    #[default]
    NoCors,
    /// CORS request.
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse a URL and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a full-page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    /// Final URL after redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ResponseBody,
}

/// Response body state.
#[derive(Debug)]
enum ResponseBody {
    Full(Bytes),
    Empty,
    /// Already read; cannot be read or cloned again.
    Used,
}

impl Response {
    /// Create an empty response.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Reason phrase for the status code.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Parsed `Content-Type` header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Whether the body has been consumed.
    pub fn body_used(&self) -> bool {
        matches!(self.body, ResponseBody::Used)
    }

    /// Make an independent copy. Reading one copy leaves the other intact.
    pub fn try_clone(&self) -> Result<Response, NetError> {
        let body = match &self.body {
            ResponseBody::Full(b) => ResponseBody::Full(b.clone()),
            ResponseBody::Empty => ResponseBody::Empty,
            ResponseBody::Used => return Err(NetError::BodyUsed),
        };

        Ok(Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body,
        })
    }

    /// Take the body, leaving the response marked as used.
    pub fn take_body(&mut self) -> Result<Bytes, NetError> {
        match std::mem::replace(&mut self.body, ResponseBody::Used) {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Used => Err(NetError::BodyUsed),
        }
    }

    /// Get the body as bytes.
    pub fn bytes(mut self) -> Result<Bytes, NetError> {
        self.take_body()
    }

    /// Get the body as text.
    pub fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Network access, injected wherever a component needs to go to the wire.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. A non-2xx status is a response, not an error;
    /// `Err` means the network layer failed.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
