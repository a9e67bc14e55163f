// Concurrency properties: the benign agent-cache miss race, parallel
// selection during training, and cache behavior under contention.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use quiver_core::policy::PolicyRegistry;
use quiver_core::{Context, ExperimentSnapshot, Pool};
use quiver_selector::config::SelectorConfig;
use quiver_selector::service::SelectorService;
use quiver_store::{MemoryKvStore, RuntimeStore, TtlCache};
use serde_json::Map;

async fn runtime_with_snapshot(experiment_id: &str, arms: usize) -> RuntimeStore {
    let runtime = RuntimeStore::new(Arc::new(MemoryKvStore::new()));
    let pool = Pool::new("p", (0..arms).map(|i| format!("arm-{i}")).collect());
    let snapshot = ExperimentSnapshot {
        id: experiment_id.to_string(),
        name: "exp".to_string(),
        pool,
        policy: "beta_ts".to_string(),
        policy_params: Map::new(),
        enabled: true,
    };
    runtime.set_snapshot(&snapshot).await.unwrap();
    runtime
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_selects_agree_on_initial_params() {
    // Two concurrent misses may both build the agent and both write params;
    // construction is deterministic, so the observable outcome is one
    // consistent state.
    let runtime = runtime_with_snapshot("e1", 3).await;
    let service = Arc::new(SelectorService::new(
        runtime.clone(),
        Arc::new(PolicyRegistry::builtin()),
        &SelectorConfig::default(),
    ));

    let mut handles = Vec::new();
    for i in 0..32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .select("e1", &Context::new(format!("c{i}")))
                .await
                .unwrap()
        }));
    }
    let mut request_ids = HashSet::new();
    for handle in handles {
        let selection = handle.await.unwrap();
        assert!(selection.arm.index < 3);
        assert!(request_ids.insert(selection.request_id));
    }

    let params = runtime.get_params("e1").await.unwrap().unwrap();
    assert_eq!(params.num_arms(), 3);
    params.validate().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn selection_stays_valid_while_params_are_rewritten() {
    // The trainer is the sole writer of trained params; the selector reads
    // whole-state snapshots. Interleave writes with selects and make sure
    // every select stays in range.
    let runtime = runtime_with_snapshot("e1", 2).await;
    let registry = Arc::new(PolicyRegistry::builtin());
    let service = Arc::new(SelectorService::new(
        runtime.clone(),
        registry.clone(),
        &SelectorConfig {
            // Tiny TTL forces frequent store reads mid-write.
            param_cache_ttl_secs: 0,
            ..SelectorConfig::default()
        },
    ));

    let writer = {
        let runtime = runtime.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let policy = registry.get("beta_ts").unwrap();
            let mut ps = policy.init_params(2, &Map::new()).unwrap();
            for i in 0..200u32 {
                ps = policy
                    .train(&ps, &Context::new("w"), (i % 2) as usize, 1.0)
                    .unwrap();
                runtime.set_params("e1", &ps, None).await.unwrap();
            }
        })
    };

    let mut selectors = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        selectors.push(tokio::spawn(async move {
            for _ in 0..100 {
                let selection = service.select("e1", &Context::new("c")).await.unwrap();
                assert!(selection.arm.index < 2);
            }
        }));
    }
    writer.await.unwrap();
    for handle in selectors {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ttl_cache_survives_hammering() {
    let cache: Arc<TtlCache<String, u64>> = Arc::new(TtlCache::new(64, Duration::from_millis(50)));
    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..500u64 {
                let key = format!("k{}", i % 100);
                cache.insert(key.clone(), worker * 1000 + i);
                let _ = cache.get(&key);
                if i % 17 == 0 {
                    cache.remove(&key);
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // Capacity is respected (approximately: concurrent inserts may briefly
    // overshoot by the number of writers).
    assert!(cache.len() <= 64 + 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalidation_during_selects_is_safe() {
    let runtime = runtime_with_snapshot("e1", 2).await;
    let service = Arc::new(SelectorService::new(
        runtime.clone(),
        Arc::new(PolicyRegistry::builtin()),
        &SelectorConfig::default(),
    ));

    let invalidator = {
        let service = service.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                service.invalidate("e1");
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };
    let mut selectors = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        selectors.push(tokio::spawn(async move {
            for _ in 0..100 {
                service.select("e1", &Context::new("c")).await.unwrap();
            }
        }));
    }
    invalidator.await.unwrap();
    for handle in selectors {
        handle.await.unwrap();
    }
}
