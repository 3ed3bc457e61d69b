//! `cache.Modifier` JSON factory
//!
//! ```json
//! {
//!   "cache.Modifier": {
//!     "mode": "record",
//!     "file": "/var/lib/rewind/traffic.rwnd",
//!     "bucket": "default",
//!     "hermetic": false,
//!     "key": { "method": true, "query": "sorted", "headers": ["accept"] },
//!     "scope": ["request", "response"]
//!   }
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use hyper::header::HeaderName;
use serde::Deserialize;

use super::{ArchivePool, CacheModifier, MODIFIER_NAME};
use crate::config::{ArchiveConfig, Mode};
use crate::key::{QueryMode, UrlKey};
use crate::modifier::{Phase, Scope};
use crate::registry::{parse_config, Built, Registry};
use crate::{Result, RewindError};

#[derive(Debug, Deserialize)]
struct CacheConfig {
    #[serde(default)]
    mode: Mode,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    hermetic: bool,
    #[serde(default)]
    key: KeyConfig,
    #[serde(default)]
    scope: Option<Vec<Phase>>,
}

#[derive(Debug, Deserialize)]
struct KeyConfig {
    #[serde(default = "default_true")]
    method: bool,
    #[serde(default)]
    query: QueryMode,
    #[serde(default)]
    headers: Vec<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            method: true,
            query: QueryMode::Raw,
            headers: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl KeyConfig {
    fn build(self) -> Result<UrlKey> {
        let headers = self
            .headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    RewindError::ConfigError(format!("invalid key header '{name}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(UrlKey::new()
            .with_method(self.method)
            .with_query(self.query)
            .with_headers(headers))
    }
}

/// Register `cache.Modifier`, opening archives through `pool`
///
/// `defaults` supplies the archive path and bucket when a config leaves
/// them out.
///
/// # Errors
///
/// Returns error if `cache.Modifier` is already registered
pub fn register(registry: &Registry, pool: Arc<ArchivePool>, defaults: ArchiveConfig) -> Result<()> {
    registry.register(MODIFIER_NAME, move |_, value| {
        let config: CacheConfig = parse_config(value)?;
        let scope = Scope::resolve(config.scope.as_deref())?;

        let file = config
            .file
            .or_else(|| defaults.default_path.clone())
            .ok_or_else(|| {
                RewindError::ConfigError(format!(
                    "{MODIFIER_NAME} needs \"file\" or a configured archive.default_path"
                ))
            })?;

        let bucket = config
            .bucket
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| defaults.bucket.clone());

        let key_fn = config.key.build()?;
        let archive = pool.open(&file)?;

        let modifier = CacheModifier::new(archive, bucket)
            .with_mode(config.mode)
            .with_key_fn(Arc::new(key_fn))
            .hermetic(config.hermetic);

        Ok(Built::new(Arc::new(modifier), scope))
    })
}
