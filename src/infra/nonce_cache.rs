//! Bounded, process-local nonce cache.
//!
//! Short-circuits chain round-trips for back-to-back allocations within one
//! process. Entries are advisory only: the allocator always reconciles them
//! against the chain's pending nonce and the durable cursor once stale.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::domain::{NonceCache, NonceCacheEntry};

/// Nonce cache configuration
#[derive(Debug, Clone)]
pub struct NonceCacheConfig {
    /// Maximum number of submitters tracked before least-recently-used eviction
    pub capacity: usize,
    /// Entries older than this are re-derived from chain and cursor
    pub staleness: Duration,
}

impl Default for NonceCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            staleness: Duration::from_secs(30),
        }
    }
}

impl NonceCacheConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        let capacity = env::var("NONCE_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.capacity);
        let staleness = env::var("NONCE_CACHE_STALENESS_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.staleness);

        Self {
            capacity,
            staleness,
        }
    }
}

/// LRU-backed [`NonceCache`].
///
/// A single short critical section per call; no lock is held across awaits.
#[derive(Debug)]
pub struct LruNonceCache {
    entries: Mutex<LruCache<String, NonceCacheEntry>>,
}

impl LruNonceCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn from_config(config: &NonceCacheConfig) -> Self {
        Self::new(config.capacity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, NonceCacheEntry>> {
        // Entries are plain values; a panic mid-update cannot leave them torn.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NonceCache for LruNonceCache {
    fn take_if_fresh(&self, submitter: &str, fresh_after: DateTime<Utc>) -> Option<u64> {
        let mut entries = self.lock();
        let entry = entries.get_mut(submitter)?;
        if entry.cached_at <= fresh_after {
            return None;
        }
        let nonce = entry.next_nonce;
        entry.next_nonce += 1;
        Some(nonce)
    }

    fn peek(&self, submitter: &str) -> Option<NonceCacheEntry> {
        self.lock().peek(submitter).copied()
    }

    fn put(&self, submitter: &str, entry: NonceCacheEntry) {
        self.lock().put(submitter.to_string(), entry);
    }

    fn clear(&self, submitter: &str) {
        self.lock().pop(submitter);
    }
}
