use std::sync::Arc;
use std::time::Duration;

use querycache::cache::{
    CacheConfig, EventKind, InvalidationStrategy, MemoryTier, QueryCache, SetOptions,
};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::TryRecvError;

const USERS: &str = "SELECT * FROM users";
const ORDERS: &str = "SELECT * FROM orders";

fn batched(batch_size: usize, timeout_ms: u64) -> QueryCache {
    QueryCache::new(
        CacheConfig {
            enable_metrics: false,
            warming_enabled: false,
            invalidation_strategy: InvalidationStrategy::Batched,
            invalidation_batch_size: batch_size,
            invalidation_batch_timeout_ms: timeout_ms,
            ..Default::default()
        },
        Arc::new(MemoryTier::new()),
    )
}

async fn seed(cache: &QueryCache) {
    cache.set(USERS, &json!(["ada"]), SetOptions::default()).await;
    cache.set(ORDERS, &json!([7]), SetOptions::default()).await;
}

#[tokio::test(start_paused = true)]
async fn notifications_within_the_window_flush_once() {
    let cache = batched(100, 1_000);
    seed(&cache).await;
    let mut events = cache.subscribe();

    for table in ["users", "orders", "users", "orders", "users"] {
        cache.invalidate_by_table(table).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Still inside the quiet period of the last notification.
    assert_eq!(cache.invalidation_flush_count(), 0);
    assert!(cache.get::<Value>(USERS, &[]).await.is_some());

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(cache.invalidation_flush_count(), 1);

    let mut invalidations = 0;
    loop {
        match events.try_recv() {
            Ok(event) => {
                if let EventKind::Invalidation { keys, strategy, .. } = event.kind {
                    invalidations += 1;
                    assert_eq!(keys, 2);
                    assert_eq!(strategy, InvalidationStrategy::Batched);
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(err) => panic!("unexpected receive error: {err}"),
        }
    }
    assert_eq!(invalidations, 1);

    assert_eq!(cache.get::<Value>(USERS, &[]).await, None);
    assert_eq!(cache.get::<Value>(ORDERS, &[]).await, None);
}

#[tokio::test(start_paused = true)]
async fn reaching_batch_size_flushes_without_waiting() {
    let cache = batched(2, 60_000);
    seed(&cache).await;

    cache.invalidate_by_table("users").await;
    assert_eq!(cache.invalidation_flush_count(), 0);

    cache.invalidate_by_table("orders").await;
    assert_eq!(cache.invalidation_flush_count(), 1);
    assert_eq!(cache.statistics().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_pending_invalidations() {
    let cache = batched(100, 60_000);
    seed(&cache).await;
    cache.start();

    cache.invalidate_by_table("users").await;
    assert!(cache.get::<Value>(USERS, &[]).await.is_some());

    cache.stop().await;
    assert_eq!(cache.invalidation_flush_count(), 1);
    assert_eq!(cache.get::<Value>(USERS, &[]).await, None);
    assert!(cache.get::<Value>(ORDERS, &[]).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn clear_cancels_the_scheduled_flush() {
    let cache = batched(100, 500);
    seed(&cache).await;

    cache.invalidate_by_table("users").await;
    cache.clear().await;
    seed(&cache).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.invalidation_flush_count(), 0);
    assert!(cache.get::<Value>(USERS, &[]).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn manual_flush_runs_early() {
    let cache = batched(100, 60_000);
    seed(&cache).await;

    cache.invalidate_by_table("orders").await;
    assert_eq!(cache.flush_invalidations().await, 1);
    assert_eq!(cache.flush_invalidations().await, 0);
    assert_eq!(cache.invalidation_flush_count(), 1);
    assert_eq!(cache.get::<Value>(ORDERS, &[]).await, None);
}
