//! Integration tests for concurrent writers sharing one store.
//!
//! Each writer is an independent `Metrics` instance, the way separate
//! processes would be, so every collision goes through the conditional put.

use std::sync::Arc;

use tierstat::clock::MockClock;
use tierstat::store::{MemoryStore, MetricStore};
use tierstat::{BackoffPolicy, Dimensions, EmitOptions, Metrics, MetricsConfig, RecordKey};

const T0: u64 = 1_700_000_100;

fn writer(store: &Arc<MemoryStore>, clock: &Arc<MockClock>) -> Arc<Metrics> {
    let config = MetricsConfig::new("acme").with_backoff(BackoffPolicy::immediate(200));
    Arc::new(Metrics::new(config, store.clone(), clock.clone()).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_lose_no_updates() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::new(T0));
    let writers = 4;
    let emits_per_writer = 50;

    let handles: Vec<_> = (0..writers)
        .map(|_| {
            let metrics = writer(&store, &clock);
            tokio::spawn(async move {
                for _ in 0..emits_per_writer {
                    metrics
                        .emit("api", "requests", 1.0, &[], EmitOptions::default())
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let key = RecordKey::new("acme", "api", "requests", &Dimensions::new());
    let record = store.get(&key).await.unwrap().unwrap();
    let total = writers * emits_per_writer;
    assert_eq!(record.total_count(), total);
    assert_eq!(record.spans[0].points[0].sum, 200.0);
    assert_eq!(record.seq, total - 1);
}

#[tokio::test]
async fn test_lost_races_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::new(T0));
    let metrics = writer(&store, &clock);

    metrics
        .emit("api", "requests", 1.0, &[], EmitOptions::default())
        .await
        .unwrap();
    store.fail_next_puts(3);
    let written = metrics
        .emit("api", "requests", 1.0, &[], EmitOptions::default())
        .await
        .unwrap();

    assert_eq!(written[0].seq, 1);
    let key = RecordKey::new("acme", "api", "requests", &Dimensions::new());
    assert_eq!(store.get(&key).await.unwrap().unwrap().total_count(), 2);
}

#[tokio::test]
async fn test_throttling_is_surfaced() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::new(T0));
    let metrics = writer(&store, &clock);

    store.throttle_next_puts(1);
    let result = metrics
        .emit("api", "requests", 1.0, &[], EmitOptions::default())
        .await;

    assert!(result.is_err());
    assert!(store.is_empty());
}
