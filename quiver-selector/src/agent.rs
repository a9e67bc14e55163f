//! Two-level agent cache: reconstructable agent objects and their parameter
//! state, each behind its own TTL.
//!
//! A cache miss rebuilds the agent from the experiment snapshot in the
//! key-value store. Two concurrent misses for the same experiment may both
//! rebuild and both write freshly initialized params; construction is
//! deterministic and the params write is last-writer-wins over an equal
//! value, so no lock is taken. Staleness after a catalog update is bounded
//! by the cache TTL.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use quiver_core::error::{Error, Result};
use quiver_core::policy::{ParamState, Policy, PolicyRegistry};
use quiver_core::Pool;
use quiver_store::{RuntimeStore, TtlCache};

use crate::config::SelectorConfig;

/// Reconstructed per-experiment selection handle: the pool, the policy, and
/// the init overrides memoized from the snapshot.
pub struct Agent {
    pub experiment_id: String,
    pub pool: Pool,
    pub policy: Arc<dyn Policy>,
    pub init_overrides: Map<String, Value>,
}

pub struct AgentCache {
    agents: TtlCache<String, Arc<Agent>>,
    params: TtlCache<String, ParamState>,
    runtime: RuntimeStore,
    registry: Arc<PolicyRegistry>,
}

impl AgentCache {
    pub fn new(
        runtime: RuntimeStore,
        registry: Arc<PolicyRegistry>,
        config: &SelectorConfig,
    ) -> Self {
        Self {
            agents: TtlCache::new(
                config.agent_cache_maxsize,
                Duration::from_secs(config.agent_cache_ttl_secs),
            ),
            params: TtlCache::new(
                config.param_cache_maxsize,
                Duration::from_secs(config.param_cache_ttl_secs),
            ),
            runtime,
            registry,
        }
    }

    pub async fn get_or_create(&self, experiment_id: &str) -> Result<Arc<Agent>> {
        if let Some(agent) = self.agents.get(&experiment_id.to_string()) {
            self.ensure_params(&agent).await?;
            return Ok(agent);
        }

        let snapshot = self
            .runtime
            .get_snapshot(experiment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("experiment not found: {experiment_id}")))?;
        let policy = self.registry.get(&snapshot.policy).ok_or_else(|| {
            Error::Internal(format!(
                "snapshot for {experiment_id} names unregistered policy {}",
                snapshot.policy
            ))
        })?;

        debug!(experiment_id, policy = %snapshot.policy, "rebuilding agent");
        let agent = Arc::new(Agent {
            experiment_id: experiment_id.to_string(),
            pool: snapshot.pool,
            policy,
            init_overrides: snapshot.policy_params,
        });
        self.ensure_params(&agent).await?;
        self.agents.insert(experiment_id.to_string(), agent.clone());
        Ok(agent)
    }

    /// Parameter state for a cached agent: L1 cache, then the store, then a
    /// fresh idempotent initialization written back to the store.
    pub async fn params_for(&self, agent: &Agent) -> Result<ParamState> {
        self.ensure_params(agent).await
    }

    async fn ensure_params(&self, agent: &Agent) -> Result<ParamState> {
        if let Some(ps) = self.params.get(&agent.experiment_id) {
            return Ok(ps);
        }
        if let Some(ps) = self.runtime.get_params(&agent.experiment_id).await? {
            self.params.insert(agent.experiment_id.clone(), ps.clone());
            return Ok(ps);
        }
        let ps = agent
            .policy
            .init_params(agent.pool.len(), &agent.init_overrides)?;
        self.runtime
            .set_params(&agent.experiment_id, &ps, None)
            .await?;
        self.params.insert(agent.experiment_id.clone(), ps.clone());
        Ok(ps)
    }

    pub fn invalidate(&self, experiment_id: &str) {
        self.agents.remove(&experiment_id.to_string());
        self.params.remove(&experiment_id.to_string());
    }
}
