//! Transaction keys for deterministic cache lookup
//!
//! A key is a SHA-256 digest over length-prefixed request attributes. Only
//! request-identifying attributes go in, so keys stay stable across retries
//! and across processes.

use std::fmt;

use hyper::header::HeaderName;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::message::RequestHead;
use crate::{Result, RewindError};

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// Opaque storage key derived from a request
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey([u8; KEY_LEN]);

impl TransactionKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary caller-chosen material into a key
    #[must_use]
    pub fn digest(material: &[u8]) -> Self {
        Self(Sha256::digest(material).into())
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionKey({})", hex::encode(&self.0[..8]))
    }
}

/// Derives a storage key from a request
///
/// Implementations must be pure: equal inputs always give equal keys, with
/// no I/O and no randomness.
pub trait KeyFunction: Send + Sync {
    /// Compute the key for `head`
    ///
    /// # Errors
    ///
    /// Returns error if the request lacks an attribute the function needs
    fn derive(&self, head: &RequestHead) -> Result<TransactionKey>;
}

impl<F> KeyFunction for F
where
    F: Fn(&RequestHead) -> Result<TransactionKey> + Send + Sync,
{
    fn derive(&self, head: &RequestHead) -> Result<TransactionKey> {
        self(head)
    }
}

/// How the query string enters the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Query string exactly as sent
    #[default]
    Raw,
    /// Pairs decoded, re-encoded and sorted
    Sorted,
}

/// Default key function: method plus canonical absolute URL
#[derive(Debug, Clone)]
pub struct UrlKey {
    include_method: bool,
    query: QueryMode,
    headers: Vec<HeaderName>,
}

impl Default for UrlKey {
    fn default() -> Self {
        Self {
            include_method: true,
            query: QueryMode::Raw,
            headers: Vec::new(),
        }
    }
}

impl UrlKey {
    /// Method + URL, raw query, no headers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include or leave out the method
    #[must_use]
    pub fn with_method(mut self, include: bool) -> Self {
        self.include_method = include;
        self
    }

    /// Choose query canonicalization
    #[must_use]
    pub fn with_query(mut self, query: QueryMode) -> Self {
        self.query = query;
        self
    }

    /// Add headers whose values take part in the key
    #[must_use]
    pub fn with_headers(mut self, mut headers: Vec<HeaderName>) -> Self {
        headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        headers.dedup();
        self.headers = headers;
        self
    }

    /// Canonical URL string for `head`
    ///
    /// # Errors
    ///
    /// Returns error if the request has no host
    pub fn canonical_url(&self, head: &RequestHead) -> Result<String> {
        let uri = head.absolute_uri()?;

        let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
        let host = uri
            .host()
            .ok_or_else(|| RewindError::KeyDerivation("request has no host".to_string()))?
            .to_ascii_lowercase();

        let mut url = format!("{scheme}://{host}");
        if let Some(port) = uri.port_u16() {
            if Some(port) != default_port(&scheme) {
                url.push_str(&format!(":{port}"));
            }
        }

        let path = uri.path();
        url.push_str(if path.is_empty() { "/" } else { path });

        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            url.push('?');
            match self.query {
                QueryMode::Raw => url.push_str(query),
                QueryMode::Sorted => url.push_str(&sorted_query(query)),
            }
        }

        Ok(url)
    }
}

impl KeyFunction for UrlKey {
    fn derive(&self, head: &RequestHead) -> Result<TransactionKey> {
        let mut hasher = Sha256::new();

        // 1. Method
        if self.include_method {
            update_field(&mut hasher, head.method.as_str().as_bytes());
        }

        // 2. Canonical URL
        let url = self.canonical_url(head)?;
        update_field(&mut hasher, url.as_bytes());

        // 3. Whitelisted headers (names sorted, values in order sent)
        for name in &self.headers {
            update_field(&mut hasher, name.as_str().as_bytes());
            let values: Vec<_> = head.headers.get_all(name).iter().collect();
            hasher.update((values.len() as u32).to_le_bytes());
            for value in values {
                update_field(&mut hasher, trim_ascii(value.as_bytes()));
            }
        }

        Ok(TransactionKey(hasher.finalize().into()))
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Decode, re-encode and sort query pairs
fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (normalize_component(k), normalize_component(v))
        })
        .collect();
    pairs.sort();

    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn normalize_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => urlencoding::encode(&decoded).into_owned(),
        Err(_) => raw.to_string(),
    }
}
