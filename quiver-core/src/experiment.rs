use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pool::Pool;

/// Durable experiment record: binds a policy family to a pool of arms.
/// `pool_id` is a non-owning reference; deleting the pool of a live
/// experiment is rejected by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub pool_id: String,
    pub policy: String,
    #[serde(default)]
    pub policy_params: Map<String, Value>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        pool_id: impl Into<String>,
        policy: impl Into<String>,
        policy_params: Map<String, Value>,
        enabled: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            pool_id: pool_id.into(),
            policy: policy.into(),
            policy_params,
            enabled,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Denormalized, read-optimized copy of an experiment (pool and arms
/// inlined) published by the proxy to the key-value store under
/// `experiment:{id}`. The selector and trainer read this and never the
/// catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub id: String,
    pub name: String,
    pub pool: Pool,
    pub policy: String,
    #[serde(default)]
    pub policy_params: Map<String, Value>,
    pub enabled: bool,
}

impl ExperimentSnapshot {
    pub fn num_arms(&self) -> usize {
        self.pool.len()
    }
}
