//! Time-bounded value cache with an injectable clock.
//!
//! Used for credentials and metadata that are cheap to keep but expire:
//! the value is refreshed lazily on the first read after it went stale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Entry<T> {
    value: T,
    fetched_at: Instant,
}

/// Caches one value for at most `ttl`.
pub struct TimedCache<T> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entry: Mutex<Option<Entry<T>>>,
}

impl<T: Clone> TimedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entry: Mutex::new(None),
        }
    }

    /// Cached value if present and not older than the TTL.
    pub fn get(&self) -> Option<T> {
        let now = self.clock.now();
        let entry = self.entry.lock();
        entry
            .as_ref()
            .filter(|e| now.saturating_duration_since(e.fetched_at) < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Store a freshly fetched value.
    pub fn set(&self, value: T) {
        *self.entry.lock() = Some(Entry {
            value,
            fetched_at: self.clock.now(),
        });
    }

    /// Drop the cached value.
    pub fn invalidate(&self) {
        *self.entry.lock() = None;
    }

    /// Cached value, or the result of `refresh` when missing or stale.
    ///
    /// Errors from `refresh` are returned and leave the cache empty.
    pub fn get_or_refresh<F>(&self, refresh: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        match refresh() {
            Ok(value) => {
                self.set(value.clone());
                Ok(value)
            }
            Err(e) => {
                self.invalidate();
                Err(e)
            }
        }
    }
}

impl<T> std::fmt::Debug for TimedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedCache").field("ttl", &self.ttl).finish()
    }
}
