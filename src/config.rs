//! Configuration types for Rewind

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::{Result, RewindError};

/// Cache operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Let traffic through and store every response
    #[default]
    #[serde(alias = "cache")]
    Record,
    /// Serve stored responses and skip the upstream round-trip
    Replay,
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy listens on
    pub listen: SocketAddr,
    /// Virtual host that serves the configuration endpoint
    #[serde(default = "default_api_host")]
    pub api_host: String,
    /// JSON modifier envelope installed at startup
    #[serde(default)]
    pub modifier_file: Option<PathBuf>,
    /// Archive defaults for `cache.Modifier`
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_api_host() -> String {
    "rewind.proxy".to_string()
}

/// Archive defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive used when a cache modifier config names no `file`
    #[serde(default)]
    pub default_path: Option<PathBuf>,
    /// Bucket used when a cache modifier config names none
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Bodies larger than this are stored as separate blobs
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,
    /// How long shutdown waits for in-flight recordings
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_bucket() -> String {
    "rewind".to_string()
}

fn default_inline_threshold() -> usize {
    64 * 1024
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            default_path: None,
            bucket: default_bucket(),
            inline_threshold: default_inline_threshold(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Maximum buffered response size in bytes
    pub max_response_size: usize,
    /// Maximum headers per request
    pub max_headers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            max_headers: 128,
        }
    }
}

impl Config {
    /// Config listening on `listen` with every other field defaulted
    #[must_use]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            api_host: default_api_host(),
            modifier_file: None,
            archive: ArchiveConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RewindError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| RewindError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.api_host.is_empty() {
            return Err(RewindError::ConfigError(
                "api_host cannot be empty".to_string(),
            ));
        }

        if let Some(file) = &self.modifier_file {
            if !file.exists() {
                return Err(RewindError::ConfigError(format!(
                    "Modifier file does not exist: {}",
                    file.display()
                )));
            }
        }

        if let Some(path) = &self.archive.default_path {
            let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(parent) = parent {
                if !parent.exists() {
                    return Err(RewindError::ConfigError(format!(
                        "Archive directory does not exist: {}",
                        parent.display()
                    )));
                }
            }
        }

        if self.archive.bucket.is_empty() {
            return Err(RewindError::ConfigError(
                "archive.bucket cannot be empty".to_string(),
            ));
        }

        let limits = &self.limits;
        for (name, value) in [
            ("max_connections", limits.max_connections),
            ("max_request_size", limits.max_request_size),
            ("max_response_size", limits.max_response_size),
            ("max_headers", limits.max_headers),
        ] {
            if value == 0 {
                return Err(RewindError::ConfigError(format!(
                    "limits.{name} must be > 0"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            listen = "127.0.0.1:8080"

            [archive]
            default_path = "/tmp/traffic.rwnd"
            inline_threshold = 1024
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.api_host, "rewind.proxy");
        assert_eq!(config.archive.bucket, "rewind");
        assert_eq!(config.archive.inline_threshold, 1024);
        assert_eq!(config.limits.max_headers, 128);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r#"
            listen = "0.0.0.0:9000"
            api_host = "control.local"

            [limits]
            max_connections = 8
            max_request_size = 1024
            max_response_size = 4096
            max_headers = 16
        "#;
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.api_host, "control.local");
        assert_eq!(config.limits.max_connections, 8);
    }

    #[test]
    fn test_invalid_config_zero_limit() {
        let config_toml = r#"
            listen = "127.0.0.1:8080"

            [limits]
            max_connections = 0
            max_request_size = 1024
            max_response_size = 4096
            max_headers = 16
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_accepts_cache_alias() {
        let mode: Mode = serde_json::from_str("\"cache\"").unwrap();
        assert_eq!(mode, Mode::Record);
        let mode: Mode = serde_json::from_str("\"replay\"").unwrap();
        assert_eq!(mode, Mode::Replay);
        assert_eq!(Mode::default(), Mode::Record);
    }
}
