use chrono::Utc;
use criterion::{Criterion, criterion_group, criterion_main};
use fenced_tx_manager::app::NonceAllocator;
use fenced_tx_manager::domain::{NonceCache, NonceCacheEntry, TransactionStore};
use fenced_tx_manager::infra::LruNonceCache;
use fenced_tx_manager::test_utils::{InMemoryTransactionStore, MockChainConnector};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn bench_cache_take(c: &mut Criterion) {
    let cache = LruNonceCache::new(10_000);
    let now = Utc::now();
    for i in 0..1_000 {
        cache.put(
            &format!("0x{:040x}", i),
            NonceCacheEntry {
                next_nonce: 0,
                cached_at: now,
            },
        );
    }
    let fresh_after = now - chrono::Duration::seconds(30);
    let submitter = format!("0x{:040x}", 500);

    c.bench_function("lru_cache_take_if_fresh", |b| {
        b.iter(|| black_box(cache.take_if_fresh(black_box(&submitter), fresh_after)))
    });
}

fn bench_allocator_fast_path(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    chain.set_pending_nonce("s1", 100);
    let allocator = NonceAllocator::new(
        chain,
        Arc::new(LruNonceCache::new(1_024)),
        Duration::from_secs(3_600),
        Duration::from_secs(1),
    );

    c.bench_function("allocator_next_nonce_cached", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut tx = store.begin().await.unwrap();
            let nonce = allocator
                .next_nonce(tx.as_mut(), "s1", store.now())
                .await
                .unwrap();
            tx.rollback().await.unwrap();
            black_box(nonce)
        })
    });
}

criterion_group!(benches, bench_cache_take, bench_allocator_fast_path);
criterion_main!(benches);
