//! Server pool: the shared registry of backends
//!
//! Membership is guarded by a reader/writer lock: `add` and `remove` take the
//! write side, every enumeration takes the read side and hands back a snapshot
//! of `Arc<Backend>` handles. Per-backend state lives in atomics on the
//! backends themselves, so callers never hold the pool lock while probing or
//! forwarding.

use crate::backend::{normalize_url, Backend};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ServerPool {
    /// Backends in insertion order (round-robin indexes into this order)
    backends: RwLock<Vec<Arc<Backend>>>,
    /// Round-robin cursor shared by every caller of the pool
    current: AtomicU64,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from already-validated backends
    pub fn with_backends(backends: impl IntoIterator<Item = Backend>) -> Self {
        let pool = Self::new();
        for backend in backends {
            pool.add(backend);
        }
        pool
    }

    /// Append a backend.
    ///
    /// Returns `None` without modifying the pool if a backend with the same
    /// URL is already registered.
    pub fn add(&self, backend: Backend) -> Option<Arc<Backend>> {
        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.url() == backend.url()) {
            return None;
        }
        let backend = Arc::new(backend);
        backends.push(Arc::clone(&backend));
        Some(backend)
    }

    /// Unlink the backend registered under `url`.
    ///
    /// Requests already holding the backend keep their handle and finish
    /// normally. Unknown or unparseable URLs return `None`.
    pub fn remove(&self, url: &str) -> Option<Arc<Backend>> {
        let key = normalize_url(url).ok()?;
        let mut backends = self.backends.write();
        let pos = backends.iter().position(|b| b.url() == key)?;
        Some(backends.remove(pos))
    }

    /// Snapshot of all backends in insertion order
    pub fn get_all(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub fn get_by_url(&self, url: &str) -> Option<Arc<Backend>> {
        let key = normalize_url(url).ok()?;
        self.backends.read().iter().find(|b| b.url() == key).cloned()
    }

    /// Whether this exact backend instance (not just its URL) is still registered
    pub fn contains(&self, backend: &Backend) -> bool {
        self.backends.read().iter().any(|b| b.id() == backend.id())
    }

    pub fn count(&self) -> usize {
        self.backends.read().len()
    }

    pub fn count_alive(&self) -> usize {
        self.backends.read().iter().filter(|b| b.is_alive()).count()
    }

    /// Advance the round-robin cursor and return its new value
    pub fn advance_cursor(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn current_cursor(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}
