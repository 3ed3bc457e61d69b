//! HTTP forward proxy that runs requests through the modifier pipeline
//!
//! The proxy accepts absolute-form requests, runs the pipeline's request
//! phase, forwards upstream unless a modifier asked to skip the round-trip,
//! then runs the response phase on whatever came back.

mod connection_limit;
mod handler;
mod server;
mod upstream;

pub use connection_limit::{ConnectionGuard, ConnectionLimit};
pub use handler::{HttpProxy, ProxyBody};
pub use server::ProxyServer;
pub use upstream::UpstreamClient;

use hyper::header::{HeaderMap, HeaderName, CONNECTION};

/// Grace period for open connections after shutdown is signalled
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Path of the configuration endpoint on the API host
pub const CONFIGURE_PATH: &str = "/configure";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
