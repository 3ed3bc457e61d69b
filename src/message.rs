//! Messages flowing through the modifier pipeline
//!
//! Requests are buffered by the host before they reach a modifier; response
//! bodies may still be streaming when response modifiers run.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, StatusCode, Uri};

use crate::key::TransactionKey;
use crate::{Result, RewindError};

/// Stream of body chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Response body: fully buffered or still arriving
pub enum Body {
    /// Complete body with known length
    Full(Bytes),
    /// Body without a declared length (chunked transfer)
    Streaming(ChunkStream),
}

impl Body {
    /// Empty body
    #[must_use]
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Buffered bytes, if the body is not streaming
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(bytes) => Some(bytes),
            Self::Streaming(_) => None,
        }
    }

    /// Check if the body is still streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}

/// Request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method
    pub method: Method,
    /// Request target, absolute or origin-form
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Create a head with no headers
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    /// Scheme of the request, `http` when the target is origin-form
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    /// Host (with optional port) from the target or the `Host` header
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        if let Some(authority) = self.uri.authority() {
            return Some(authority.as_str());
        }
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|h| !h.is_empty())
    }

    /// Host without port
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        if let Some(host) = self.uri.host() {
            return Some(host);
        }
        self.authority().map(strip_port)
    }

    /// Absolute form of the request target
    ///
    /// # Errors
    ///
    /// Returns error if neither the target nor the `Host` header names a host
    pub fn absolute_uri(&self) -> Result<Uri> {
        if self.uri.authority().is_some() {
            return Ok(self.uri.clone());
        }

        let authority = self.authority().ok_or_else(|| {
            RewindError::KeyDerivation(format!("request {} {} has no host", self.method, self.uri))
        })?;
        let path = self.uri.path_and_query().map_or("/", |pq| pq.as_str());

        format!("{}://{authority}{path}", self.scheme())
            .parse::<Uri>()
            .map_err(|e| RewindError::KeyDerivation(format!("invalid request target: {e}")))
    }
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority
            .find(']')
            .map_or(authority, |end| &authority[..=end]);
    }
    authority.rsplit_once(':').map_or(authority, |(host, _)| host)
}

/// Buffered HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    /// Request line and headers
    pub head: RequestHead,
    /// Request body
    pub body: Bytes,
}

impl Request {
    /// Create a bodiless request
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            head: RequestHead::new(method, uri),
            body: Bytes::new(),
        }
    }

    /// Parse `uri` and create a bodiless request
    ///
    /// # Errors
    ///
    /// Returns error if `uri` is not a valid request target
    pub fn parse(method: Method, uri: &str) -> Result<Self> {
        let uri = uri
            .parse::<Uri>()
            .map_err(|e| RewindError::InvalidFormat(format!("invalid URI '{uri}': {e}")))?;
        Ok(Self::new(method, uri))
    }

    /// Headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Mutable headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }
}

/// HTTP response bound to the request that produced it
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Body,
    /// Originating request
    pub request: RequestHead,
}

impl Response {
    /// Create a response with no headers
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Body>, request: RequestHead) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            request,
        }
    }

    /// Plain-text error response
    #[must_use]
    pub fn error(status: StatusCode, message: &str, request: RequestHead) -> Self {
        let mut res = Self::new(status, Bytes::from(message.to_string()), request);
        res.headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        res
    }
}

/// Request-scoped decision record
///
/// Owned by one request's execution and handed by reference to every
/// modifier on both phases.
#[derive(Debug, Default)]
pub struct Context {
    secure: bool,
    skip_round_trip: bool,
    skip_logging: bool,
    replayed: bool,
    cache_key: Option<TransactionKey>,
    synthesized: Option<Response>,
}

impl Context {
    /// Fresh context for a plaintext session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh context for a session with the given TLS state
    #[must_use]
    pub fn with_secure(secure: bool) -> Self {
        Self {
            secure,
            ..Self::default()
        }
    }

    /// Whether the session was TLS-intercepted
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Ask the host not to send the request upstream
    pub fn skip_round_trip(&mut self) {
        self.skip_round_trip = true;
    }

    /// Whether the upstream round-trip is skipped
    #[must_use]
    pub fn skipping_round_trip(&self) -> bool {
        self.skip_round_trip
    }

    /// Ask the host not to log this request
    pub fn skip_logging(&mut self) {
        self.skip_logging = true;
    }

    /// Whether logging is suppressed
    #[must_use]
    pub fn skipping_logging(&self) -> bool {
        self.skip_logging
    }

    /// Override the cache key derived for this request
    pub fn set_cache_key(&mut self, key: TransactionKey) {
        self.cache_key = Some(key);
    }

    /// Cache key override, if any
    #[must_use]
    pub fn cache_key(&self) -> Option<&TransactionKey> {
        self.cache_key.as_ref()
    }

    /// Serve `response` from storage and skip the upstream round-trip
    pub fn replay(&mut self, response: Response) {
        self.replayed = true;
        self.skip_round_trip = true;
        self.synthesized = Some(response);
    }

    /// Whether the response came from storage
    #[must_use]
    pub fn was_replayed(&self) -> bool {
        self.replayed
    }

    /// Take the synthesized response, leaving `None`
    pub fn take_synthesized(&mut self) -> Option<Response> {
        self.synthesized.take()
    }
}
