//! Modifier registry
//!
//! Maps a configuration type name to a factory that turns the JSON body of
//! a `{"<type-name>": {...}}` envelope into a modifier and its scope.
//! Factories may build nested envelopes through the registry they receive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::modifier::{Modifier, Noop, Phase, Scope, Scoped, SkipRoundTrip};
use crate::{filter, Result, RewindError};

/// Factory turning a config body into a modifier
pub type Factory = Arc<dyn Fn(&Registry, Value) -> Result<Built> + Send + Sync>;

/// A constructed modifier bound to its declared scope
#[derive(Clone)]
pub struct Built {
    /// The modifier
    pub modifier: Arc<dyn Modifier>,
    /// Phases it applies to
    pub scope: Scope,
}

impl Built {
    /// Pair a modifier with its scope
    #[must_use]
    pub fn new(modifier: Arc<dyn Modifier>, scope: Scope) -> Self {
        Self { modifier, scope }
    }

    /// Wrap the modifier so it only runs in its scope
    #[must_use]
    pub fn into_scoped(self) -> Scoped {
        Scoped::new(self.modifier, self.scope)
    }
}

/// Decode a factory's config body, ignoring unknown fields
///
/// # Errors
///
/// Returns error if the body does not fit `T`
pub fn parse_config<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Type-name to factory mapping
///
/// Usually populated once at startup and read-only afterwards.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl Registry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop.Modifier`, `skip.RoundTrip` and the built-in filters
    ///
    /// `cache.Modifier` needs an archive pool and is added by
    /// [`crate::cache::register`].
    ///
    /// # Errors
    ///
    /// Returns error if a built-in name is registered twice
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();

        registry.register("noop.Modifier", |_, value| {
            let config: NoopConfig = parse_config(value)?;
            let scope = Scope::resolve(config.scope.as_deref())?;
            Ok(Built::new(Arc::new(Noop::new(config.id)), scope))
        })?;

        registry.register("skip.RoundTrip", |_, value| {
            let config: ScopeOnly = parse_config(value)?;
            let scope = Scope::resolve(config.scope.as_deref())?;
            Ok(Built::new(Arc::new(SkipRoundTrip), scope))
        })?;

        filter::register(&registry)?;

        Ok(registry)
    }

    /// Register `factory` under `name`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateModifier` if `name` is taken
    pub fn register<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&Registry, Value) -> Result<Built> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            return Err(RewindError::DuplicateModifier(name.to_string()));
        }
        factories.insert(name.to_string(), Arc::new(factory));
        debug!("Registered modifier type {}", name);
        Ok(())
    }

    /// Check if `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered type names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a modifier from a JSON envelope
    ///
    /// # Errors
    ///
    /// Returns `UnknownModifier` for an unregistered type name, or the
    /// factory's error
    pub fn build(&self, json: &[u8]) -> Result<Built> {
        let value: Value = serde_json::from_slice(json)?;
        self.build_value(value)
    }

    /// Build a modifier from an already decoded envelope
    ///
    /// # Errors
    ///
    /// Returns `UnknownModifier` for an unregistered type name, or the
    /// factory's error
    pub fn build_value(&self, envelope: Value) -> Result<Built> {
        let Value::Object(map) = envelope else {
            return Err(RewindError::ConfigError(
                "modifier envelope must be a JSON object".to_string(),
            ));
        };

        if map.len() != 1 {
            return Err(RewindError::ConfigError(format!(
                "modifier envelope must have exactly one type name, got {}",
                map.len()
            )));
        }

        let Some((name, config)) = map.into_iter().next() else {
            return Err(RewindError::ConfigError(
                "empty modifier envelope".to_string(),
            ));
        };

        // Clone out so nested builds never wait on our own lock
        let factory = self
            .factories
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| RewindError::UnknownModifier(name.clone()))?;

        debug!("Building modifier {}", name);
        factory(self, config)
    }
}

#[derive(Debug, Deserialize)]
struct NoopConfig {
    #[serde(default = "default_noop_id")]
    id: String,
    #[serde(default)]
    scope: Option<Vec<Phase>>,
}

fn default_noop_id() -> String {
    "noop.Modifier".to_string()
}

#[derive(Debug, Deserialize)]
struct ScopeOnly {
    #[serde(default)]
    scope: Option<Vec<Phase>>,
}
