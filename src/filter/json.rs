//! JSON factories for the built-in filters
//!
//! Every filter config accepts `modifier` (true branch), `else` (false
//! branch) and `scope` next to its own fields. Branches are themselves
//! modifier envelopes built through the registry.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{
    Condition, CookieMatcher, Filter, HeaderMatcher, MuxMatcher, SecureMatcher, UrlMatcher,
    UrlRegexMatcher,
};
use crate::modifier::{Phase, Scope};
use crate::registry::{parse_config, Built, Registry};
use crate::Result;

#[derive(Debug, Default, Deserialize)]
struct Branches {
    #[serde(default)]
    modifier: Option<Value>,
    #[serde(default, rename = "else")]
    else_modifier: Option<Value>,
    #[serde(default)]
    scope: Option<Vec<Phase>>,
}

impl Branches {
    fn assemble(self, registry: &Registry, condition: Arc<dyn Condition>) -> Result<Built> {
        let scope = Scope::resolve(self.scope.as_deref())?;
        let mut filter = Filter::new(condition);

        if let Some(envelope) = self.modifier {
            filter = filter.when_true(Arc::new(registry.build_value(envelope)?.into_scoped()));
        }
        if let Some(envelope) = self.else_modifier {
            filter = filter.when_false(Arc::new(registry.build_value(envelope)?.into_scoped()));
        }

        Ok(Built::new(Arc::new(filter), scope))
    }
}

#[derive(Debug, Deserialize)]
struct HeaderFilterConfig {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(flatten)]
    branches: Branches,
}

#[derive(Debug, Deserialize)]
struct CookieFilterConfig {
    name: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(flatten)]
    branches: Branches,
}

#[derive(Debug, Deserialize)]
struct UrlFilterConfig {
    #[serde(default)]
    scheme: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    query: String,
    #[serde(flatten)]
    branches: Branches,
}

#[derive(Debug, Deserialize)]
struct UrlRegexFilterConfig {
    regex: String,
    #[serde(flatten)]
    branches: Branches,
}

#[derive(Debug, Deserialize)]
struct MuxFilterConfig {
    patterns: Vec<String>,
    #[serde(flatten)]
    branches: Branches,
}

#[derive(Debug, Deserialize)]
struct SecureFilterConfig {
    #[serde(default = "default_secure")]
    secure: bool,
    #[serde(flatten)]
    branches: Branches,
}

fn default_secure() -> bool {
    true
}

/// Register the built-in filter types
///
/// # Errors
///
/// Returns error if any of the names is already registered
pub fn register(registry: &Registry) -> Result<()> {
    registry.register("header.Filter", |registry, value| {
        let config: HeaderFilterConfig = parse_config(value)?;
        let matcher = HeaderMatcher::new(&config.name, config.value)?;
        config.branches.assemble(registry, Arc::new(matcher))
    })?;

    registry.register("cookie.Filter", |registry, value| {
        let config: CookieFilterConfig = parse_config(value)?;
        let matcher = CookieMatcher::new(config.name, config.value);
        config.branches.assemble(registry, Arc::new(matcher))
    })?;

    registry.register("url.Filter", |registry, value| {
        let config: UrlFilterConfig = parse_config(value)?;
        let matcher = UrlMatcher::new()
            .scheme(config.scheme)
            .host(config.host)
            .path(config.path)
            .query(config.query);
        config.branches.assemble(registry, Arc::new(matcher))
    })?;

    registry.register("url.RegexFilter", |registry, value| {
        let config: UrlRegexFilterConfig = parse_config(value)?;
        let matcher = UrlRegexMatcher::new(&config.regex)?;
        config.branches.assemble(registry, Arc::new(matcher))
    })?;

    registry.register("mux.Filter", |registry, value| {
        let config: MuxFilterConfig = parse_config(value)?;
        let mut matcher = MuxMatcher::new();
        for pattern in &config.patterns {
            matcher = matcher.handle(pattern)?;
        }
        config.branches.assemble(registry, Arc::new(matcher))
    })?;

    registry.register("secure.Filter", |registry, value| {
        let config: SecureFilterConfig = parse_config(value)?;
        let matcher = SecureMatcher::new(config.secure);
        config.branches.assemble(registry, Arc::new(matcher))
    })?;

    Ok(())
}
