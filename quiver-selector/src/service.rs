//! Pure bandit selection: no gate evaluation in this tier (the proxy runs
//! the gate before calling in).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quiver_core::error::{Error, Result};
use quiver_core::policy::PolicyRegistry;
use quiver_core::Context;
use quiver_store::RuntimeStore;

use crate::agent::AgentCache;
use crate::config::SelectorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmDescriptor {
    pub id: String,
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub arm: ArmDescriptor,
    /// Placeholder; the proxy replaces it with the signed selection token.
    pub request_id: String,
    pub score: f64,
}

pub struct SelectorService {
    cache: AgentCache,
}

impl SelectorService {
    pub fn new(
        runtime: RuntimeStore,
        registry: Arc<PolicyRegistry>,
        config: &SelectorConfig,
    ) -> Self {
        Self {
            cache: AgentCache::new(runtime, registry, config),
        }
    }

    pub async fn select(&self, experiment_id: &str, ctx: &Context) -> Result<Selection> {
        let agent = self.cache.get_or_create(experiment_id).await?;
        let params = self.cache.params_for(&agent).await?;
        let arm_index = agent.policy.select(&params, ctx, &mut rand::thread_rng())?;
        let arm = agent.pool.arm(arm_index).ok_or_else(|| {
            Error::Internal(format!(
                "policy {} selected arm {arm_index} outside pool of {} arms",
                agent.policy.name(),
                agent.pool.len()
            ))
        })?;
        Ok(Selection {
            arm: ArmDescriptor {
                id: arm.id.clone(),
                name: arm.name.clone(),
                index: arm_index,
            },
            request_id: Uuid::new_v4().simple().to_string(),
            score: 0.0,
        })
    }

    /// Evict both cache levels for an experiment (catalog update/delete).
    pub fn invalidate(&self, experiment_id: &str) {
        self.cache.invalidate(experiment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::{ExperimentSnapshot, Pool};
    use quiver_store::MemoryKvStore;
    use serde_json::Map;

    async fn service_with_snapshot(policy: &str) -> (SelectorService, RuntimeStore) {
        let runtime = RuntimeStore::new(Arc::new(MemoryKvStore::new()));
        let snapshot = ExperimentSnapshot {
            id: "e1".into(),
            name: "exp".into(),
            pool: Pool::new("p", vec!["a".into(), "b".into(), "c".into()]),
            policy: policy.into(),
            policy_params: Map::new(),
            enabled: true,
        };
        runtime.set_snapshot(&snapshot).await.unwrap();
        let service = SelectorService::new(
            runtime.clone(),
            Arc::new(PolicyRegistry::builtin()),
            &SelectorConfig::default(),
        );
        (service, runtime)
    }

    #[tokio::test]
    async fn select_returns_arm_and_initializes_params() {
        let (service, runtime) = service_with_snapshot("beta_ts").await;
        let selection = service.select("e1", &Context::new("c")).await.unwrap();
        assert!(selection.arm.index < 3);
        assert_eq!(selection.score, 0.0);
        // First selection initialized params in the store.
        let params = runtime.get_params("e1").await.unwrap().unwrap();
        assert_eq!(params.num_arms(), 3);
    }

    #[tokio::test]
    async fn unknown_experiment_is_not_found() {
        let (service, _) = service_with_snapshot("beta_ts").await;
        let err = service.select("nope", &Context::new("c")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn selections_are_distinct_request_ids() {
        let (service, _) = service_with_snapshot("fpl").await;
        let a = service.select("e1", &Context::new("c")).await.unwrap();
        let b = service.select("e1", &Context::new("c")).await.unwrap();
        assert_ne!(a.request_id, b.request_id);
    }
}
