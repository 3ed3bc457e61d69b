//! Error types for Rewind

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for Rewind operations
pub type Result<T> = std::result::Result<T, RewindError>;

/// Errors that can occur in Rewind
#[derive(Debug, Error)]
pub enum RewindError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON configuration could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid archive or index encoding
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Checksum mismatch
    #[error("Data corrupted at offset {offset}: expected CRC {expected:#x}, got {actual:#x}")]
    CorruptedData {
        /// Offset where corruption was detected
        offset: u64,
        /// Expected CRC32 value
        expected: u32,
        /// Actual CRC32 value
        actual: u32,
    },

    /// Archive container or working area is not in the expected shape
    #[error("Corrupt archive {}: {reason}", path.display())]
    CorruptArchive {
        /// Archive container path
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// A previous write failed; the archive refuses further work
    #[error("Archive is broken: {0}")]
    ArchiveBroken(String),

    /// Archive was already closed
    #[error("Archive is closed")]
    ArchiveClosed,

    /// Another handle holds the archive open
    #[error("Archive is locked by another process: {}", .0.display())]
    ArchiveLocked(PathBuf),

    /// Configuration names a modifier type nobody registered
    #[error("Unknown modifier: {0}")]
    UnknownModifier(String),

    /// A factory was registered twice under the same type name
    #[error("Modifier already registered: {0}")]
    DuplicateModifier(String),

    /// A modifier failed while processing a request or response
    #[error("Modifier {name} failed: {source}")]
    ModifierFailed {
        /// Registered type name of the failing modifier
        name: String,
        /// Underlying cause
        #[source]
        source: Box<RewindError>,
    },

    /// Transaction key could not be derived from the request
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Hermetic replay found no stored transaction
    #[error("No stored transaction for key {0} (hermetic replay)")]
    HermeticMiss(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Upstream round-trip failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl RewindError {
    /// Wrap an error as the failure of the named modifier
    pub fn modifier_failed(name: impl Into<String>, source: RewindError) -> Self {
        Self::ModifierFailed {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// True if configuration referenced an unregistered modifier type
    #[must_use]
    pub fn is_unknown_modifier(&self) -> bool {
        matches!(self, Self::UnknownModifier(_))
    }

    /// True if this error (or its wrapped cause) reports archive corruption
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::CorruptArchive { .. } | Self::CorruptedData { .. } => true,
            Self::ModifierFailed { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}
