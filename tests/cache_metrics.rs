use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use querycache::cache::{
    CacheConfig, InvalidationStrategy, MemoryTier, QueryCache, SetOptions,
};
use serde_json::{Value, json};
use serial_test::serial;

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

fn snapshotter() -> &'static Snapshotter {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

fn counters() -> HashMap<String, u64> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(composite_key, _, _, value)| match value {
            DebugValue::Counter(count) => Some((composite_key.key().name().to_string(), count)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let snapshotter = snapshotter();

    // hit / miss / set / delete / evict + local bytes gauge
    let cache = QueryCache::new(
        CacheConfig {
            max_entries: 1,
            warming_threshold: 1,
            ..Default::default()
        },
        Arc::new(MemoryTier::new()),
    );
    cache.get::<Value>("SELECT * FROM users", &[]).await;
    cache
        .set("SELECT * FROM users", &json!(1), SetOptions::default())
        .await;
    cache.get::<Value>("SELECT * FROM users", &[]).await;
    cache
        .set("SELECT * FROM orders", &json!(2), SetOptions::default())
        .await;
    let key = cache.cache_key("SELECT * FROM orders", &[]);
    assert!(cache.delete(&key).await);

    // cleanup + warming latencies
    cache.run_cleanup();
    cache
        .run_warming()
        .await
        .expect("no other warming cycle is running");

    // batched flush latency
    let batched = QueryCache::new(
        CacheConfig {
            invalidation_strategy: InvalidationStrategy::Batched,
            ..Default::default()
        },
        Arc::new(MemoryTier::new()),
    );
    batched
        .set("SELECT * FROM users", &json!(1), SetOptions::default())
        .await;
    batched.invalidate_by_table("users").await;
    assert_eq!(batched.flush_invalidations().await, 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "querycache_hit_total",
        "querycache_miss_total",
        "querycache_set_total",
        "querycache_delete_total",
        "querycache_evict_total",
        "querycache_local_bytes",
        "querycache_cleanup_ms",
        "querycache_warm_ms",
        "querycache_invalidation_flush_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn disabled_metrics_leave_counters_untouched() {
    let before = counters();

    let cache = QueryCache::new(
        CacheConfig {
            enable_metrics: false,
            ..Default::default()
        },
        Arc::new(MemoryTier::new()),
    );
    cache.get::<Value>("SELECT * FROM users", &[]).await;
    cache
        .set("SELECT * FROM users", &json!(1), SetOptions::default())
        .await;
    cache.get::<Value>("SELECT * FROM users", &[]).await;
    cache.invalidate_by_table("users").await;

    assert_eq!(counters(), before);
}
