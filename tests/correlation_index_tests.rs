//! Correlation index under concurrent use.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use rust_loadharness::correlation::{CorrelationIndex, CorrelationKey};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_keys_from_many_tasks_behave_like_sequential_use() {
    let index = Arc::new(CorrelationIndex::new());
    let base = Instant::now();

    let mut tasks = Vec::new();
    for identity in 0..8u32 {
        let index = index.clone();
        tasks.push(tokio::spawn(async move {
            let mut rng = rand::thread_rng();
            let mut counters: Vec<u64> = (0..200).collect();
            counters.shuffle(&mut rng);

            for &counter in &counters {
                let key = CorrelationKey::new(identity, counter).to_string();
                let expiry = base + Duration::from_millis(rng.gen_range(1..1_000));
                index.put(key.clone(), expiry);
                assert_eq!(index.get(&key), Some(expiry));
            }

            // Keep even counters, remove odd ones.
            for &counter in &counters {
                let key = CorrelationKey::new(identity, counter).to_string();
                if counter % 2 == 1 {
                    assert!(index.take(&key).is_some());
                    assert!(index.take(&key).is_none());
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(index.len(), 8 * 100);
    for identity in 0..8u32 {
        for counter in 0..200u64 {
            let key = CorrelationKey::new(identity, counter).to_string();
            assert_eq!(index.get(&key).is_some(), counter % 2 == 0, "{}", key);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_takes_resolve_each_key_once() {
    let index = Arc::new(CorrelationIndex::new());
    let expiry = Instant::now() + Duration::from_secs(1);
    for counter in 0..500u64 {
        index.put(CorrelationKey::new(1, counter).to_string(), expiry);
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let index = index.clone();
        tasks.push(tokio::spawn(async move {
            (0..500u64)
                .filter(|&counter| {
                    index
                        .take(&CorrelationKey::new(1, counter).to_string())
                        .is_some()
                })
                .count()
        }));
    }

    let mut taken = 0;
    for task in tasks {
        taken += task.await.unwrap();
    }
    assert_eq!(taken, 500, "every key must be taken exactly once");
    assert!(index.is_empty());
}

#[tokio::test]
async fn purge_keeps_entries_within_grace() {
    let index = CorrelationIndex::new();
    let now = Instant::now();
    index.put("1 0", now);
    index.put("1 1", now + Duration::from_secs(5));

    assert_eq!(index.purge_expired_before(now + Duration::from_secs(1)), 1);
    assert_eq!(index.get("1 0"), None);
    assert!(index.get("1 1").is_some());
}
