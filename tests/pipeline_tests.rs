// End-to-end scenarios across all three tiers wired in-process over one
// temporary store: select -> feedback -> train, token tamper/expiry, gate
// short-circuiting, and cache invalidation after catalog writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quiver_core::gate::GateConfig;
use quiver_core::policy::PolicyRegistry;
use quiver_core::{Context, Error, ParamState};
use quiver_proxy::config::ProxyConfig;
use quiver_proxy::selector_client::LocalSelectorClient;
use quiver_proxy::service::ProxyService;
use quiver_selector::config::SelectorConfig;
use quiver_selector::service::SelectorService;
use quiver_store::{ArmSpec, Catalog, FeedbackStream, RuntimeStore, SledFeedbackStream, SledKvStore};
use quiver_trainer::config::TrainerConfig;
use quiver_trainer::service::TrainerService;
use serde_json::Map;

struct Stack {
    _db: sled::Db,
    runtime: RuntimeStore,
    stream: Arc<SledFeedbackStream>,
    proxy: Arc<ProxyService>,
    trainer: Arc<TrainerService>,
}

fn build_stack(token_max_age_ms: Option<i64>) -> Stack {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let kv = Arc::new(SledKvStore::open(&db).unwrap());
    let runtime = RuntimeStore::new(kv);
    let catalog = Arc::new(Catalog::open(&db).unwrap());
    let stream = Arc::new(SledFeedbackStream::open(&db, "feedback", 10_000).unwrap());
    let registry = Arc::new(PolicyRegistry::builtin());

    let selector = Arc::new(SelectorService::new(
        runtime.clone(),
        registry.clone(),
        &SelectorConfig::default(),
    ));

    let proxy_config = ProxyConfig {
        token_secret: "pipeline-test-secret".to_string(),
        token_max_age_ms,
        ..ProxyConfig::default()
    };
    let proxy = Arc::new(ProxyService::new(
        catalog,
        runtime.clone(),
        stream.clone(),
        Arc::new(LocalSelectorClient::new(selector)),
        registry.clone(),
        &proxy_config,
    ));

    let trainer_config = TrainerConfig {
        batch_timeout_ms: 100,
        flush_interval_secs: 0,
        ..TrainerConfig::default()
    };
    let trainer = TrainerService::new(stream.clone(), runtime.clone(), registry, trainer_config);

    Stack {
        _db: db,
        runtime,
        stream,
        proxy,
        trainer,
    }
}

fn arm_specs(names: &[&str]) -> Vec<ArmSpec> {
    names
        .iter()
        .map(|n| ArmSpec {
            name: n.to_string(),
            metadata: HashMap::new(),
        })
        .collect()
}

async fn wait_for_params<F>(runtime: &RuntimeStore, experiment_id: &str, predicate: F)
where
    F: Fn(&ParamState) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(params) = runtime.get_params(experiment_id).await.unwrap() {
            if predicate(&params) {
                return;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "params never reached the expected state"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn beta_alpha(params: &ParamState) -> Vec<f64> {
    match params {
        ParamState::BetaTs(s) => s.alpha.clone(),
        other => panic!("unexpected state: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn basic_select_feedback_train_cycle() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a", "b"])).unwrap();
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, None)
        .await
        .unwrap();

    let outcome = stack
        .proxy
        .select(&experiment.id, Context::new("c1"))
        .await
        .unwrap();
    assert!(!outcome.is_default);
    assert!(outcome.arm.index < 2);
    let selected = outcome.arm.index;

    let accepted = stack
        .proxy
        .feedback(&outcome.request_id, 1.0)
        .await
        .unwrap();
    assert!(accepted);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(stack.trainer.clone().run(shutdown_rx));

    wait_for_params(&stack.runtime, &experiment.id, |params| {
        beta_alpha(params)[selected] == 2.0
    })
    .await;
    let params = stack
        .runtime
        .get_params(&experiment.id)
        .await
        .unwrap()
        .unwrap();
    let alpha = beta_alpha(&params);
    // Only the selected arm moved.
    assert_eq!(alpha[1 - selected], 1.0);

    let _ = shutdown_tx.send(true);
    let _ = task.await;
}

#[tokio::test]
async fn tampered_token_is_rejected_without_publishing() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a", "b"])).unwrap();
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, None)
        .await
        .unwrap();
    let outcome = stack
        .proxy
        .select(&experiment.id, Context::new("c1"))
        .await
        .unwrap();

    let mut chars: Vec<char> = outcome.request_id.chars().collect();
    let last = *chars.last().unwrap();
    *chars.last_mut().unwrap() = if last == 'A' { 'B' } else { 'A' };
    let tampered: String = chars.into_iter().collect();

    let err = stack.proxy.feedback(&tampered, 1.0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    // Nothing reached the stream.
    assert_eq!(stack.stream.len().await.unwrap(), 0);
}

#[tokio::test]
async fn expired_token_is_deadline_exceeded() {
    let stack = build_stack(Some(50));
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a"])).unwrap();
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, None)
        .await
        .unwrap();
    let outcome = stack
        .proxy
        .select(&experiment.id, Context::new("c1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let err = stack
        .proxy
        .feedback(&outcome.request_id, 1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(_)));
    assert_eq!(stack.stream.len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_gate_commits_default_arm_and_still_trains() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a", "b"])).unwrap();
    let default_arm = pool.arms[0].clone();
    let gate = GateConfig {
        enabled: false,
        default_arm_id: Some(default_arm.id.clone()),
        ..GateConfig::default()
    };
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, Some(gate))
        .await
        .unwrap();

    let outcome = stack
        .proxy
        .select(&experiment.id, Context::new("c1"))
        .await
        .unwrap();
    assert!(outcome.is_default);
    assert_eq!(outcome.arm.id, default_arm.id);
    assert_eq!(outcome.arm.index, 0);

    // The committed-arm token is a normal token: feedback trains as usual.
    stack
        .proxy
        .feedback(&outcome.request_id, 1.0)
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(stack.trainer.clone().run(shutdown_rx));
    wait_for_params(&stack.runtime, &experiment.id, |params| {
        beta_alpha(params) == vec![2.0, 1.0]
    })
    .await;
    let _ = shutdown_tx.send(true);
    let _ = task.await;
}

#[tokio::test]
async fn select_unknown_experiment_is_not_found() {
    let stack = build_stack(None);
    let err = stack
        .proxy
        .select("ghost", Context::new("c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn feedback_survives_experiment_deletion() {
    // The whole point of the token: feedback is a one-hop stream write and
    // never consults the catalog or the selector.
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a"])).unwrap();
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, None)
        .await
        .unwrap();
    let outcome = stack
        .proxy
        .select(&experiment.id, Context::new("c1"))
        .await
        .unwrap();

    stack.proxy.delete_experiment(&experiment.id).await.unwrap();

    let accepted = stack
        .proxy
        .feedback(&outcome.request_id, 1.0)
        .await
        .unwrap();
    assert!(accepted);
    assert_eq!(stack.stream.len().await.unwrap(), 1);

    // The trainer later counts it as an unknown-experiment drop.
    let msgs = stack
        .stream
        .consume("trainer", "worker-0", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].1.experiment_id, experiment.id);
}

#[tokio::test]
async fn policy_change_resets_params_and_reaches_the_selector() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a", "b"])).unwrap();
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, None)
        .await
        .unwrap();

    // Prime the selector cache and the params key.
    stack
        .proxy
        .select(&experiment.id, Context::new("c1"))
        .await
        .unwrap();
    assert!(matches!(
        stack.runtime.get_params(&experiment.id).await.unwrap(),
        Some(ParamState::BetaTs(_))
    ));

    let update = quiver_store::ExperimentUpdate {
        policy: Some("fpl".to_string()),
        ..Default::default()
    };
    stack
        .proxy
        .update_experiment(&experiment.id, update)
        .await
        .unwrap();

    // The local selector was invalidated eagerly; the next select rebuilds
    // the agent under the new policy and re-initializes params.
    stack
        .proxy
        .select(&experiment.id, Context::new("c2"))
        .await
        .unwrap();
    assert!(matches!(
        stack.runtime.get_params(&experiment.id).await.unwrap(),
        Some(ParamState::Fpl(_))
    ));
}

#[tokio::test]
async fn select_validates_context_dimension_for_contextual_policies() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a", "b"])).unwrap();
    let mut params = Map::new();
    params.insert("dim".to_string(), serde_json::json!(3));
    let experiment = stack
        .proxy
        .create_experiment("exp", &pool.id, "lin_ucb", params, true, None)
        .await
        .unwrap();

    let good = stack
        .proxy
        .select(
            &experiment.id,
            Context::new("c1").with_vector(vec![0.1, 0.2, 0.3]),
        )
        .await
        .unwrap();
    assert!(good.arm.index < 2);

    let err = stack
        .proxy
        .select(&experiment.id, Context::new("c1").with_vector(vec![0.1]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn gate_with_unknown_arm_is_rejected_at_write_time() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a"])).unwrap();
    let gate = GateConfig {
        default_arm_id: Some("not-a-real-arm".to_string()),
        ..GateConfig::default()
    };
    let err = stack
        .proxy
        .create_experiment("exp", &pool.id, "beta_ts", Map::new(), true, Some(gate))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn unknown_policy_is_invalid_argument() {
    let stack = build_stack(None);
    let pool = stack.proxy.create_pool("pool", arm_specs(&["a"])).unwrap();
    let err = stack
        .proxy
        .create_experiment("exp", &pool.id, "thompson-deluxe", Map::new(), true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
