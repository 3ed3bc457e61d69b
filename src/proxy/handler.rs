//! Per-request handling: pipeline phases, upstream round-trip, configure API

use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE, WARNING};
use hyper::{Method, StatusCode};
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::message::{Body, Context, Request, RequestHead, Response};
use crate::modifier::{Modifier, Pipeline};
use crate::registry::Registry;
use crate::{Result, RewindError};

use super::{strip_hop_by_hop, UpstreamClient, CONFIGURE_PATH};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type the proxy answers with
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Runs one request at a time through the pipeline
pub struct HttpProxy {
    pipeline: Arc<Pipeline>,
    registry: Arc<Registry>,
    upstream: UpstreamClient,
    api_host: String,
    limits: LimitsConfig,
}

impl HttpProxy {
    /// Proxy running `pipeline`, reconfigurable through `registry`
    #[must_use]
    pub fn new(
        pipeline: Arc<Pipeline>,
        registry: Arc<Registry>,
        api_host: impl Into<String>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            pipeline,
            registry,
            upstream: UpstreamClient::new(limits.max_response_size),
            api_host: api_host.into(),
            limits,
        }
    }

    /// Pipeline whose root handles proxied traffic
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Handle one client request
    ///
    /// Modifier errors are logged and reported in a `Warning` header; the
    /// request still proceeds. Upstream failures answer 502.
    pub async fn handle<B>(&self, req: hyper::Request<B>) -> hyper::Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let mut head = RequestHead {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        };

        if head.headers.len() > self.limits.max_headers {
            warn!("Rejecting request with {} headers", head.headers.len());
            return plain(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "too many headers");
        }

        let body = match read_body(body, self.limits.max_request_size).await {
            Ok(body) => body,
            Err(e @ RewindError::DataTooLarge { .. }) => {
                return plain(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string());
            }
            Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        if head.host() == Some(self.api_host.as_str()) && head.uri.path() == CONFIGURE_PATH {
            return self.configure(&head.method, &body);
        }

        strip_hop_by_hop(&mut head.headers);
        let mut request = Request { head, body };
        let mut ctx = Context::new();
        let mut warnings = Vec::new();

        // Both phases run against the root current at arrival.
        let root = self.pipeline.current();
        if let Err(e) = root.modify_request(&mut request, &mut ctx) {
            warn!("Request modifier failed for {}: {}", request.head.uri, e);
            warnings.push(e.to_string());
        }

        let mut response = if ctx.skipping_round_trip() {
            ctx.take_synthesized().unwrap_or_else(|| {
                Response::new(StatusCode::OK, Body::empty(), request.head.clone())
            })
        } else {
            match self.upstream.round_trip(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Upstream {} failed: {}", request.head.uri, e);
                    let status = if matches!(e, RewindError::KeyDerivation(_)) {
                        StatusCode::BAD_REQUEST
                    } else {
                        StatusCode::BAD_GATEWAY
                    };
                    return plain(status, &e.to_string());
                }
            }
        };

        strip_hop_by_hop(&mut response.headers);
        if let Err(e) = root.modify_response(&mut response, &mut ctx) {
            warn!("Response modifier failed for {}: {}", request.head.uri, e);
            warnings.push(e.to_string());
        }

        if !ctx.skipping_logging() {
            info!(
                "{} {} -> {}{}",
                request.head.method,
                request.head.uri,
                response.status.as_u16(),
                if ctx.was_replayed() { " (replayed)" } else { "" }
            );
        }

        for warning in warnings {
            if let Ok(value) = HeaderValue::from_str(&format!("199 rewind {warning:?}")) {
                response.headers.append(WARNING, value);
            }
        }

        into_hyper(response)
    }

    fn configure(&self, method: &Method, body: &[u8]) -> hyper::Response<ProxyBody> {
        if method != Method::POST {
            let mut res = plain(StatusCode::METHOD_NOT_ALLOWED, "use POST");
            res.headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            return res;
        }

        match self.pipeline.configure(&self.registry, body) {
            Ok(()) => {
                info!("Pipeline reconfigured");
                plain(StatusCode::OK, "")
            }
            Err(e) => {
                warn!("Rejected configuration: {}", e);
                plain(StatusCode::BAD_REQUEST, &e.to_string())
            }
        }
    }
}

async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match Limited::new(body, max_size).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => Err(RewindError::DataTooLarge {
            size: max_size + 1,
            limit: max_size,
        }),
        Err(e) => Err(RewindError::InvalidFormat(format!(
            "failed to read request body: {e}"
        ))),
    }
}

fn plain(status: StatusCode, message: &str) -> hyper::Response<ProxyBody> {
    debug!("answering {} locally", status);
    let mut res = hyper::Response::new(full(Bytes::from(message.to_string())));
    *res.status_mut() = status;
    if !message.is_empty() {
        res.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    res
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn into_hyper(response: Response) -> hyper::Response<ProxyBody> {
    let body = match response.body {
        Body::Full(bytes) => full(bytes),
        Body::Streaming(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
    };

    let mut res = hyper::Response::new(body);
    *res.status_mut() = response.status;
    *res.headers_mut() = response.headers;
    res
}
