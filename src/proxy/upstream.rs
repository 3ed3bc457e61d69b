//! HTTP client for the upstream round-trip

use std::io;
use std::time::Duration;

use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::message::{Body, Request, Response};
use crate::{Result, RewindError};

/// Forwards pipeline requests to their origin
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    max_response_size: usize,
}

impl UpstreamClient {
    /// Client that buffers at most `max_response_size` bytes per sized body
    #[must_use]
    pub fn new(max_response_size: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self {
            client,
            max_response_size,
        }
    }

    /// Send `request` to its origin
    ///
    /// A response with a `Content-Length` comes back buffered; anything else
    /// streams through.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent, or if a sized body is
    /// over the limit or fails to arrive
    pub async fn round_trip(&self, request: &Request) -> Result<Response> {
        let uri = request.head.absolute_uri()?;
        debug!("Forwarding {} to {}", request.head.method, uri);

        let mut outbound = hyper::Request::new(Full::new(request.body.clone()));
        *outbound.method_mut() = request.head.method.clone();
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = request.head.headers.clone();

        let response = self.client.request(outbound).await.map_err(|e| {
            warn!("Request failed: {e}");
            RewindError::Upstream(format!("request failed: {e}"))
        })?;

        let (parts, incoming) = response.into_parts();
        let body = if parts.headers.contains_key(CONTENT_LENGTH) {
            Body::Full(self.collect(incoming).await?)
        } else {
            let stream = incoming.into_data_stream().map_err(io::Error::other);
            Body::Streaming(Box::pin(stream))
        };

        let mut res = Response::new(parts.status, body, request.head.clone());
        res.headers = parts.headers;
        Ok(res)
    }

    async fn collect(&self, incoming: Incoming) -> Result<Bytes> {
        let collected = Limited::new(incoming, self.max_response_size)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<http_body_util::LengthLimitError>() {
                    RewindError::DataTooLarge {
                        size: self.max_response_size + 1,
                        limit: self.max_response_size,
                    }
                } else {
                    RewindError::Upstream(format!("failed to read response body: {e}"))
                }
            })?;
        Ok(collected.to_bytes())
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(crate::config::LimitsConfig::default().max_response_size)
    }
}
