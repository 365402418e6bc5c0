//! Nonce allocation: `max(chain pending nonce, local floor)`.
//!
//! The local floor is the cached next value when one exists (never regress
//! below a nonce already handed out by this process), otherwise the durable
//! cursor. The cache only short-circuits repeated chain round-trips.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::worker::with_chain_timeout;
use crate::domain::{AppError, ChainConnector, NonceCache, NonceCacheEntry, StoreTransaction};

/// Computes the next nonce for a submitter.
///
/// Callers that consumed allocations in a transaction that later failed
/// must call [`NonceAllocator::clear_cache`] for every submitter involved.
pub struct NonceAllocator {
    chain: Arc<dyn ChainConnector>,
    cache: Arc<dyn NonceCache>,
    staleness: Duration,
    chain_timeout: Duration,
}

impl NonceAllocator {
    #[must_use]
    pub fn new(
        chain: Arc<dyn ChainConnector>,
        cache: Arc<dyn NonceCache>,
        staleness: Duration,
        chain_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            cache,
            staleness,
            chain_timeout,
        }
    }

    /// Allocate the next nonce. The durable cursor is read through `tx`.
    pub async fn next_nonce(
        &self,
        tx: &mut dyn StoreTransaction,
        submitter: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let staleness = chrono::Duration::from_std(self.staleness)
            .map_err(|e| AppError::Internal(format!("Invalid staleness window: {}", e)))?;

        if let Some(nonce) = self.cache.take_if_fresh(submitter, now - staleness) {
            debug!(submitter = %submitter, nonce, "Nonce served from cache");
            return Ok(nonce);
        }

        let chain_pending = with_chain_timeout(
            self.chain_timeout,
            "get_pending_nonce",
            self.chain.get_pending_nonce(submitter),
        )
        .await?;

        let local_floor = match self.cache.peek(submitter) {
            Some(entry) => entry.next_nonce,
            None => tx
                .get_nonce_cursor(submitter)
                .await?
                .map(|cursor| cursor.next_nonce)
                .unwrap_or(0),
        };

        let allocated = chain_pending.max(local_floor);
        self.cache.put(
            submitter,
            NonceCacheEntry {
                next_nonce: allocated + 1,
                cached_at: now,
            },
        );

        debug!(
            submitter = %submitter,
            chain_pending,
            local_floor,
            allocated,
            "Nonce derived from chain and local floor"
        );
        Ok(allocated)
    }

    /// Next value the cache would hand out, used to advance the durable cursor.
    #[must_use]
    pub fn cached_next(&self, submitter: &str) -> Option<u64> {
        self.cache.peek(submitter).map(|entry| entry.next_nonce)
    }

    pub fn clear_cache(&self, submitter: &str) {
        self.cache.clear(submitter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionStore;
    use crate::infra::LruNonceCache;
    use crate::test_utils::{InMemoryTransactionStore, MockChainConnector};

    fn allocator(chain: Arc<MockChainConnector>, cache: Arc<LruNonceCache>) -> NonceAllocator {
        NonceAllocator::new(
            chain,
            cache,
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }

    async fn seed_cursor(store: &InMemoryTransactionStore, submitter: &str, next: u64) {
        store.seed_lease(submitter, "node-a", 1, chrono::Duration::seconds(60));
        let mut tx = store.begin().await.unwrap();
        tx.advance_nonce_cursor(submitter, next, 1).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_wins_over_lower_cursor() {
        let store = InMemoryTransactionStore::new();
        seed_cursor(&store, "s1", 7).await;
        let chain = Arc::new(MockChainConnector::new());
        chain.set_pending_nonce("s1", 10);
        let allocator = allocator(chain, Arc::new(LruNonceCache::new(16)));

        let mut tx = store.begin().await.unwrap();
        let nonce = allocator.next_nonce(tx.as_mut(), "s1", Utc::now()).await.unwrap();
        assert_eq!(nonce, 10);
        assert_eq!(allocator.cached_next("s1"), Some(11));
    }

    #[tokio::test]
    async fn test_cursor_wins_over_lower_chain() {
        let store = InMemoryTransactionStore::new();
        seed_cursor(&store, "s1", 12).await;
        let chain = Arc::new(MockChainConnector::new());
        chain.set_pending_nonce("s1", 10);
        let allocator = allocator(chain, Arc::new(LruNonceCache::new(16)));

        let mut tx = store.begin().await.unwrap();
        let nonce = allocator.next_nonce(tx.as_mut(), "s1", Utc::now()).await.unwrap();
        assert_eq!(nonce, 12);
    }

    #[tokio::test]
    async fn test_fast_path_skips_chain() {
        let store = InMemoryTransactionStore::new();
        let chain = Arc::new(MockChainConnector::new());
        chain.set_pending_nonce("s1", 3);
        let allocator = allocator(Arc::clone(&chain), Arc::new(LruNonceCache::new(16)));
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", now).await.unwrap(), 3);
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", now).await.unwrap(), 4);
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", now).await.unwrap(), 5);
        assert_eq!(chain.pending_nonce_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_never_regresses_below_handed_out_value() {
        let store = InMemoryTransactionStore::new();
        let chain = Arc::new(MockChainConnector::new());
        chain.set_pending_nonce("s1", 3);
        let cache = Arc::new(LruNonceCache::new(16));
        let allocator = allocator(Arc::clone(&chain), Arc::clone(&cache));
        let then = Utc::now() - chrono::Duration::seconds(120);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", then).await.unwrap(), 3);
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", then).await.unwrap(), 4);

        // Entry is now stale; chain still reports 3 but the floor is 5.
        let nonce = allocator.next_nonce(tx.as_mut(), "s1", Utc::now()).await.unwrap();
        assert_eq!(nonce, 5);
        assert_eq!(chain.pending_nonce_calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_rederives_from_chain_and_cursor() {
        let store = InMemoryTransactionStore::new();
        let chain = Arc::new(MockChainConnector::new());
        chain.set_pending_nonce("s1", 3);
        let allocator = allocator(Arc::clone(&chain), Arc::new(LruNonceCache::new(16)));
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", now).await.unwrap(), 3);
        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", now).await.unwrap(), 4);
        allocator.clear_cache("s1");

        assert_eq!(allocator.next_nonce(tx.as_mut(), "s1", now).await.unwrap(), 3);
        assert_eq!(chain.pending_nonce_calls(), 2);
    }

    #[tokio::test]
    async fn test_uninitialized_cursor_defaults_to_zero() {
        let store = InMemoryTransactionStore::new();
        let chain = Arc::new(MockChainConnector::new());
        let allocator = allocator(chain, Arc::new(LruNonceCache::new(16)));

        let mut tx = store.begin().await.unwrap();
        let nonce = allocator.next_nonce(tx.as_mut(), "fresh", Utc::now()).await.unwrap();
        assert_eq!(nonce, 0);
    }
}
