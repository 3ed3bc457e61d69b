//! Bounded concurrent connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of connections served at once
#[derive(Clone)]
pub struct ConnectionLimit {
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionLimit {
    /// Allow up to `max_connections` at once
    ///
    /// # Panics
    ///
    /// Panics if `max_connections` is 0
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        assert!(max_connections > 0, "max_connections must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            active_count: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Take a slot, or `None` when every slot is in use
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            _permit: permit,
            active_count: Arc::clone(&self.active_count),
        })
    }

    /// Connections currently holding a slot
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Slot count
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Slot held for the life of one connection
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let limit = ConnectionLimit::new(2);

        let first = limit.try_acquire();
        let second = limit.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(limit.active_connections(), 2);

        assert!(limit.try_acquire().is_none());
    }

    #[test]
    fn test_release_on_drop() {
        let limit = ConnectionLimit::new(1);
        {
            let _guard = limit.try_acquire().unwrap();
            assert_eq!(limit.active_connections(), 1);
        }
        assert_eq!(limit.active_connections(), 0);
        assert!(limit.try_acquire().is_some());
    }

    #[test]
    #[should_panic(expected = "max_connections must be > 0")]
    fn test_zero_panics() {
        let _ = ConnectionLimit::new(0);
    }
}
