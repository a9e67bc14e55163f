//! Proxy service: catalog writes with snapshot publication, gated selection
//! with token issuance, and one-hop feedback intake.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use quiver_core::error::{Error, Result};
use quiver_core::gate::GateConfig;
use quiver_core::policy::PolicyRegistry;
use quiver_core::{Context, Experiment, ExperimentSnapshot, FeedbackEvent, Pool};
use quiver_selector::service::ArmDescriptor;
use quiver_store::{ArmSpec, Catalog, ExperimentUpdate, FeedbackStream, RuntimeStore, TtlCache};

use crate::config::ProxyConfig;
use crate::gate::FeatureGate;
use crate::selector_client::SelectorClient;
use crate::token::{TokenCodec, TokenError};

#[derive(Debug, Clone, Serialize)]
pub struct SelectOutcome {
    pub arm: ArmDescriptor,
    /// The signed selection token.
    pub request_id: String,
    pub is_default: bool,
    pub score: f64,
}

fn gate_arm_ids(config: &GateConfig) -> impl Iterator<Item = &String> {
    config
        .default_arm_id
        .iter()
        .chain(config.rules.iter().filter_map(|r| r.committed_arm_id.as_ref()))
}

pub struct ProxyService {
    catalog: Arc<Catalog>,
    runtime: RuntimeStore,
    stream: Arc<dyn FeedbackStream>,
    selector: Arc<dyn SelectorClient>,
    registry: Arc<PolicyRegistry>,
    tokens: TokenCodec,
    gate_cache: TtlCache<String, GateConfig>,
}

impl ProxyService {
    pub fn new(
        catalog: Arc<Catalog>,
        runtime: RuntimeStore,
        stream: Arc<dyn FeedbackStream>,
        selector: Arc<dyn SelectorClient>,
        registry: Arc<PolicyRegistry>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            catalog,
            runtime,
            stream,
            selector,
            registry,
            tokens: TokenCodec::new(config.token_secret.as_bytes().to_vec(), config.token_max_age_ms),
            gate_cache: TtlCache::new(
                config.gate_cache_maxsize,
                Duration::from_secs(config.gate_cache_ttl_secs),
            ),
        }
    }

    // -- pools --------------------------------------------------------------

    pub fn create_pool(&self, name: &str, arms: Vec<ArmSpec>) -> Result<Pool> {
        self.catalog.create_pool(name, arms)
    }

    pub fn get_pool(&self, id: &str) -> Result<Pool> {
        self.catalog.get_pool(id)
    }

    pub fn delete_pool(&self, id: &str) -> Result<()> {
        self.catalog.delete_pool(id)
    }

    pub fn list_pools(&self, limit: usize, offset: usize) -> Result<Vec<Pool>> {
        self.catalog.list_pools(limit, offset)
    }

    // -- experiments --------------------------------------------------------

    pub async fn create_experiment(
        &self,
        name: &str,
        pool_id: &str,
        policy: &str,
        policy_params: Map<String, Value>,
        enabled: bool,
        gate: Option<GateConfig>,
    ) -> Result<Experiment> {
        let policy_obj = self.registry.get(policy).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unknown policy {policy}; registered: {}",
                self.registry.names().join(", ")
            ))
        })?;
        let pool = self.catalog.get_pool(pool_id)?;
        // Reject bad policy params and bad gate arm refs before anything
        // durable happens.
        policy_obj.init_params(pool.len(), &policy_params)?;
        if let Some(gate) = &gate {
            for arm_id in gate_arm_ids(gate) {
                if pool.arm_by_id(arm_id).is_none() {
                    return Err(Error::InvalidArgument(format!(
                        "arm {arm_id} does not belong to pool {pool_id}"
                    )));
                }
            }
            gate.validate()?;
        }

        let experiment = self.catalog.create_experiment(Experiment::new(
            name,
            pool_id,
            policy,
            policy_params,
            enabled,
        ))?;
        if let Some(gate) = gate {
            self.catalog.create_gate(&experiment.id, gate)?;
        }
        self.publish_snapshot(&experiment.id).await?;
        Ok(experiment)
    }

    pub fn get_experiment(&self, id: &str) -> Result<Experiment> {
        self.catalog.get_experiment(id)
    }

    pub async fn update_experiment(&self, id: &str, update: ExperimentUpdate) -> Result<Experiment> {
        if let Some(policy) = update.policy.as_deref() {
            if !self.registry.contains(policy) {
                return Err(Error::InvalidArgument(format!("unknown policy {policy}")));
            }
        }
        // A policy (or policy-param) change restarts learning: stale state
        // from the previous policy must not be folded into the new one.
        let resets_params = update.policy.is_some() || update.policy_params.is_some();
        let experiment = self.catalog.update_experiment(id, update)?;
        if resets_params {
            self.runtime.delete_params(id).await?;
        }
        self.publish_snapshot(id).await?;
        Ok(experiment)
    }

    pub async fn delete_experiment(&self, id: &str) -> Result<()> {
        self.catalog.delete_experiment(id)?;
        self.runtime.purge_experiment(id).await?;
        self.gate_cache.remove(&id.to_string());
        if let Err(e) = self.selector.invalidate(id).await {
            debug!(experiment_id = id, error = %e, "selector invalidation skipped");
        }
        Ok(())
    }

    pub fn list_experiments(&self, limit: usize, offset: usize) -> Result<Vec<Experiment>> {
        self.catalog.list_experiments(limit, offset)
    }

    // -- gates --------------------------------------------------------------

    pub async fn create_gate(&self, experiment_id: &str, config: GateConfig) -> Result<GateConfig> {
        self.validate_gate_arms(experiment_id, &config)?;
        let created = self.catalog.create_gate(experiment_id, config)?;
        self.publish_snapshot(experiment_id).await?;
        Ok(created)
    }

    pub fn get_gate(&self, experiment_id: &str) -> Result<GateConfig> {
        self.catalog.get_gate(experiment_id)
    }

    pub async fn update_gate(&self, experiment_id: &str, config: GateConfig) -> Result<GateConfig> {
        self.validate_gate_arms(experiment_id, &config)?;
        let updated = self.catalog.update_gate(experiment_id, config)?;
        self.publish_snapshot(experiment_id).await?;
        Ok(updated)
    }

    pub async fn delete_gate(&self, experiment_id: &str) -> Result<()> {
        self.catalog.delete_gate(experiment_id)?;
        self.runtime.delete_gate(experiment_id).await?;
        self.gate_cache.remove(&experiment_id.to_string());
        if let Err(e) = self.selector.invalidate(experiment_id).await {
            debug!(experiment_id, error = %e, "selector invalidation skipped");
        }
        Ok(())
    }

    /// Every arm a gate commits must belong to the experiment's pool.
    fn validate_gate_arms(&self, experiment_id: &str, config: &GateConfig) -> Result<()> {
        for arm_id in gate_arm_ids(config) {
            self.catalog.resolve_arm(experiment_id, arm_id)?;
        }
        Ok(())
    }

    // -- select / feedback --------------------------------------------------

    pub async fn select(&self, experiment_id: &str, context: Context) -> Result<SelectOutcome> {
        if let Some(arm_id) = self.evaluate_gate(experiment_id, &context).await {
            if let Some(outcome) = self
                .committed_outcome(experiment_id, &arm_id, &context)
                .await?
            {
                return Ok(outcome);
            }
            // An unresolvable committed arm falls back to the bandit.
        }

        let selection = self.selector.select(experiment_id, &context).await?;
        let token = self
            .tokens
            .encode(experiment_id, selection.arm.index, &context)
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(SelectOutcome {
            arm: selection.arm,
            request_id: token,
            is_default: false,
            score: selection.score,
        })
    }

    /// Gate evaluation is fail-open: any failure selects via the bandit.
    async fn evaluate_gate(&self, experiment_id: &str, context: &Context) -> Option<String> {
        let config = match self.gate_config(experiment_id).await {
            Ok(Some(config)) => config,
            Ok(None) => return None,
            Err(e) => {
                warn!(experiment_id, error = %e, "gate evaluation failed, falling back to bandit");
                return None;
            }
        };
        FeatureGate::evaluate(&config, &context.id, &context.metadata)
    }

    /// Two-level gate config lookup: in-process TTL cache over the KV
    /// snapshot.
    async fn gate_config(&self, experiment_id: &str) -> Result<Option<GateConfig>> {
        if let Some(config) = self.gate_cache.get(&experiment_id.to_string()) {
            return Ok(Some(config));
        }
        match self.runtime.get_gate(experiment_id).await? {
            Some(config) => {
                self.gate_cache
                    .insert(experiment_id.to_string(), config.clone());
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Synthesize a response for a gate-committed arm. The token is identical
    /// in kind to a bandit token, so feedback trains normally.
    async fn committed_outcome(
        &self,
        experiment_id: &str,
        arm_id: &str,
        context: &Context,
    ) -> Result<Option<SelectOutcome>> {
        let snapshot = self
            .runtime
            .get_snapshot(experiment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("experiment not found: {experiment_id}")))?;
        let Some(arm) = snapshot.pool.arm_by_id(arm_id) else {
            warn!(
                experiment_id,
                arm_id, "gate committed an arm missing from the pool; using bandit"
            );
            return Ok(None);
        };
        let token = self
            .tokens
            .encode(experiment_id, arm.index, context)
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Some(SelectOutcome {
            arm: ArmDescriptor {
                id: arm.id.clone(),
                name: arm.name.clone(),
                index: arm.index,
            },
            request_id: token,
            is_default: true,
            score: 0.0,
        }))
    }

    /// One-hop feedback: decode the token, publish, done. Never touches the
    /// catalog or the selector.
    pub async fn feedback(&self, request_id: &str, reward: f64) -> Result<bool> {
        let entry = self.tokens.decode(request_id).map_err(|e| match e {
            TokenError::Invalid(_) => Error::InvalidArgument(e.to_string()),
            TokenError::Expired { .. } => Error::DeadlineExceeded(e.to_string()),
        })?;

        let event = FeedbackEvent {
            experiment_id: entry.experiment_id,
            request_id: request_id.to_string(),
            arm_index: entry.arm_index,
            reward,
            context_id: entry.context_id,
            context_vector: entry.context_vector,
            context_metadata: entry.context_metadata,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        self.stream.publish(&event).await?;
        Ok(true)
    }

    pub async fn health(&self) -> bool {
        self.stream.len().await.is_ok() && self.selector.health().await
    }

    /// Republishes the denormalized snapshot (and gate snapshot) after a
    /// catalog write, then nudges the selector cache.
    async fn publish_snapshot(&self, experiment_id: &str) -> Result<()> {
        let (experiment, pool) = self.catalog.experiment_with_pool(experiment_id)?;
        let snapshot = ExperimentSnapshot {
            id: experiment.id.clone(),
            name: experiment.name.clone(),
            pool,
            policy: experiment.policy.clone(),
            policy_params: experiment.policy_params.clone(),
            enabled: experiment.enabled,
        };
        self.runtime.set_snapshot(&snapshot).await?;

        match self.catalog.get_gate(experiment_id) {
            Ok(gate) => {
                self.runtime.set_gate(experiment_id, &gate).await?;
                self.gate_cache.insert(experiment_id.to_string(), gate);
            }
            Err(Error::NotFound(_)) => {
                self.runtime.delete_gate(experiment_id).await?;
                self.gate_cache.remove(&experiment_id.to_string());
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.selector.invalidate(experiment_id).await {
            debug!(experiment_id, error = %e, "selector invalidation skipped");
        }
        Ok(())
    }
}
