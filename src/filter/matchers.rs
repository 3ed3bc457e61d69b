//! Concrete conditions

use hyper::header::{HeaderMap, HeaderName, COOKIE, SET_COOKIE};
use regex::Regex;

use super::Condition;
use crate::message::{Context, Request, RequestHead, Response};
use crate::{Result, RewindError};

/// Matches when a header carries an exact value
///
/// Any one of several values is enough; an absent header never matches.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: HeaderName,
    value: String,
}

impl HeaderMatcher {
    /// Match header `name` against `value`
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not a valid header name
    pub fn new(name: &str, value: impl Into<String>) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RewindError::ConfigError(format!("invalid header name '{name}': {e}")))?;
        Ok(Self {
            name,
            value: value.into(),
        })
    }

    fn matches(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(&self.name)
            .iter()
            .any(|v| v.as_bytes() == self.value.as_bytes())
    }
}

impl Condition for HeaderMatcher {
    fn match_request(&self, req: &Request, _ctx: &Context) -> bool {
        self.matches(req.headers())
    }

    fn match_response(&self, res: &Response, _ctx: &Context) -> bool {
        self.matches(&res.headers)
    }
}

/// Matches a cookie by name, and by value when one is given
///
/// Requests are tested against `Cookie`, responses against `Set-Cookie`.
#[derive(Debug, Clone)]
pub struct CookieMatcher {
    name: String,
    value: Option<String>,
}

impl CookieMatcher {
    /// Match cookie `name`, optionally requiring `value`
    #[must_use]
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value: value.filter(|v| !v.is_empty()),
        }
    }

    fn accepts(&self, name: &str, value: &str) -> bool {
        name == self.name && self.value.as_deref().map_or(true, |want| want == value)
    }
}

impl Condition for CookieMatcher {
    fn match_request(&self, req: &Request, _ctx: &Context) -> bool {
        req.headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|line| line.split(';'))
            .filter_map(split_pair)
            .any(|(name, value)| self.accepts(name, value))
    }

    fn match_response(&self, res: &Response, _ctx: &Context) -> bool {
        res.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|line| line.split(';').next())
            .filter_map(split_pair)
            .any(|(name, value)| self.accepts(name, value))
    }
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (name, value) = pair.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((name.trim(), value))
}

/// Matches URL components; unset components match anything
///
/// Responses are tested against their originating request.
#[derive(Debug, Clone, Default)]
pub struct UrlMatcher {
    scheme: Option<String>,
    host: Option<String>,
    path: Option<String>,
    query: Option<String>,
}

impl UrlMatcher {
    /// Matcher with every component unset
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a scheme
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = non_empty(scheme.into());
        self
    }

    /// Require a host; `*.example.com` also matches any subdomain
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = non_empty(host.into());
        self
    }

    /// Require an exact path
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = non_empty(path.into());
        self
    }

    /// Require an exact raw query
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = non_empty(query.into());
        self
    }

    fn matches(&self, head: &RequestHead) -> bool {
        if let Some(scheme) = &self.scheme {
            if !scheme.eq_ignore_ascii_case(head.scheme()) {
                return false;
            }
        }

        if let Some(pattern) = &self.host {
            match head.authority() {
                Some(host) if match_host(host, pattern) => {}
                _ => return false,
            }
        }

        if let Some(path) = &self.path {
            if path != head.uri.path() {
                return false;
            }
        }

        if let Some(query) = &self.query {
            if Some(query.as_str()) != head.uri.query() {
                return false;
            }
        }

        true
    }
}

impl Condition for UrlMatcher {
    fn match_request(&self, req: &Request, _ctx: &Context) -> bool {
        self.matches(&req.head)
    }

    fn match_response(&self, res: &Response, _ctx: &Context) -> bool {
        self.matches(&res.request)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn match_host(host: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let suffix = suffix.to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        return host
            .strip_suffix(&suffix)
            .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1);
    }
    host.eq_ignore_ascii_case(pattern)
}

/// Matches the absolute request URL against a regular expression
#[derive(Debug, Clone)]
pub struct UrlRegexMatcher {
    regex: Regex,
}

impl UrlRegexMatcher {
    /// Compile `pattern`
    ///
    /// # Errors
    ///
    /// Returns error if `pattern` is not a valid regular expression
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| RewindError::ConfigError(format!("invalid regex '{pattern}': {e}")))?;
        Ok(Self { regex })
    }

    fn matches(&self, head: &RequestHead) -> bool {
        match head.absolute_uri() {
            Ok(uri) => self.regex.is_match(&uri.to_string()),
            Err(_) => self.regex.is_match(&head.uri.to_string()),
        }
    }
}

impl Condition for UrlRegexMatcher {
    fn match_request(&self, req: &Request, _ctx: &Context) -> bool {
        self.matches(&req.head)
    }

    fn match_response(&self, res: &Response, _ctx: &Context) -> bool {
        self.matches(&res.request)
    }
}

/// Matches request paths against mux-style patterns
///
/// A pattern ending in `/` matches that path and everything below it; any
/// other pattern matches exactly. A pattern may start with a host, as in
/// `api.example.com/v1/`, to match on that host only.
#[derive(Debug, Clone, Default)]
pub struct MuxMatcher {
    patterns: Vec<MuxPattern>,
}

#[derive(Debug, Clone)]
struct MuxPattern {
    host: Option<String>,
    path: String,
}

impl MuxMatcher {
    /// Matcher with no patterns
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern
    ///
    /// # Errors
    ///
    /// Returns error if the pattern has no path component
    pub fn handle(mut self, pattern: &str) -> Result<Self> {
        let (host, path) = match pattern.find('/') {
            Some(0) => (None, pattern),
            Some(i) => (Some(pattern[..i].to_ascii_lowercase()), &pattern[i..]),
            None => {
                return Err(RewindError::ConfigError(format!(
                    "mux pattern '{pattern}' has no path"
                )))
            }
        };
        self.patterns.push(MuxPattern {
            host,
            path: path.to_string(),
        });
        Ok(self)
    }

    fn matches(&self, head: &RequestHead) -> bool {
        let path = match head.uri.path() {
            "" => "/",
            p => p,
        };
        let host = head.host().map(str::to_ascii_lowercase);

        self.patterns.iter().any(|pattern| {
            if let Some(want) = &pattern.host {
                if host.as_deref() != Some(want.as_str()) {
                    return false;
                }
            }
            if pattern.path.ends_with('/') {
                path.starts_with(&pattern.path)
            } else {
                path == pattern.path
            }
        })
    }
}

impl Condition for MuxMatcher {
    fn match_request(&self, req: &Request, _ctx: &Context) -> bool {
        self.matches(&req.head)
    }

    fn match_response(&self, res: &Response, _ctx: &Context) -> bool {
        self.matches(&res.request)
    }
}

/// Matches on whether the session was TLS-intercepted
#[derive(Debug, Clone, Copy)]
pub struct SecureMatcher {
    secure: bool,
}

impl SecureMatcher {
    /// Match sessions whose TLS state equals `secure`
    #[must_use]
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }
}

impl Condition for SecureMatcher {
    fn match_request(&self, _req: &Request, ctx: &Context) -> bool {
        ctx.is_secure() == self.secure
    }

    fn match_response(&self, _res: &Response, ctx: &Context) -> bool {
        ctx.is_secure() == self.secure
    }
}
