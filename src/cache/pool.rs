//! Open archives shared between cache modifiers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::storage::Archive;
use crate::Result;

/// Archives keyed by path
///
/// Reconfiguring a cache modifier for a path that is already open reuses
/// the live archive instead of fighting over its lock. Closed or broken
/// archives are reopened from their container file.
pub struct ArchivePool {
    archives: DashMap<PathBuf, Arc<Archive>>,
    inline_threshold: usize,
}

impl ArchivePool {
    /// Pool whose archives inline bodies up to `inline_threshold` bytes
    #[must_use]
    pub fn new(inline_threshold: usize) -> Self {
        Self {
            archives: DashMap::new(),
            inline_threshold,
        }
    }

    /// Open `path`, or return the archive already open there
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be opened
    pub fn open(&self, path: &Path) -> Result<Arc<Archive>> {
        match self.archives.entry(path.to_path_buf()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_open() {
                    return Ok(Arc::clone(slot.get()));
                }
                info!("Reopening archive {}", path.display());
                let archive = Arc::new(Archive::open_with(path, self.inline_threshold)?);
                slot.insert(Arc::clone(&archive));
                Ok(archive)
            }
            Entry::Vacant(slot) => {
                let archive = Arc::new(Archive::open_with(path, self.inline_threshold)?);
                slot.insert(Arc::clone(&archive));
                Ok(archive)
            }
        }
    }

    /// Archive open at `path`, if any
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<Archive>> {
        self.archives.get(path).map(|a| Arc::clone(a.value()))
    }

    /// Number of archives in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.archives.len()
    }

    /// Check if the pool holds no archives
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    /// Wait for in-flight recordings, then close every archive
    ///
    /// Each archive gets up to `timeout` to drain. Every archive is closed
    /// even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first close error
    pub async fn close_all(&self, timeout: Duration) -> Result<()> {
        let archives: Vec<Arc<Archive>> = self
            .archives
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.archives.clear();

        let mut first_error = None;
        for archive in archives {
            if !archive.drain(timeout).await {
                warn!(
                    "{} streaming writes to {} did not finish within {:?}",
                    archive.pending_writes(),
                    archive.path().display(),
                    timeout
                );
            }

            if let Err(e) = archive.close() {
                warn!("Failed to close {}: {}", archive.path().display(), e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
