//! Typed view over the key-value store for runtime state: experiment
//! snapshots (proxy writes, selector/trainer read), parameter state (trainer
//! writes, selector initializes when absent), and gate snapshots.

use std::sync::Arc;
use std::time::Duration;

use quiver_core::error::Result;
use quiver_core::gate::GateConfig;
use quiver_core::policy::ParamState;
use quiver_core::ExperimentSnapshot;

use crate::kv::KvStore;

#[derive(Clone)]
pub struct RuntimeStore {
    kv: Arc<dyn KvStore>,
}

impl RuntimeStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn snapshot_key(experiment_id: &str) -> String {
        format!("experiment:{experiment_id}")
    }

    fn params_key(experiment_id: &str) -> String {
        format!("params:{experiment_id}")
    }

    fn gate_key(experiment_id: &str) -> String {
        format!("gate:{experiment_id}")
    }

    pub async fn get_snapshot(&self, experiment_id: &str) -> Result<Option<ExperimentSnapshot>> {
        match self.kv.get(&Self::snapshot_key(experiment_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_snapshot(&self, snapshot: &ExperimentSnapshot) -> Result<()> {
        let raw = serde_json::to_vec(snapshot)?;
        self.kv.set(&Self::snapshot_key(&snapshot.id), raw, None).await
    }

    pub async fn get_params(&self, experiment_id: &str) -> Result<Option<ParamState>> {
        match self.kv.get(&Self::params_key(experiment_id)).await? {
            Some(raw) => {
                let ps: ParamState = serde_json::from_slice(&raw)?;
                ps.validate()?;
                Ok(Some(ps))
            }
            None => Ok(None),
        }
    }

    pub async fn set_params(
        &self,
        experiment_id: &str,
        params: &ParamState,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_vec(params)?;
        self.kv.set(&Self::params_key(experiment_id), raw, ttl).await
    }

    pub async fn delete_params(&self, experiment_id: &str) -> Result<()> {
        self.kv.delete(&Self::params_key(experiment_id)).await
    }

    pub async fn get_gate(&self, experiment_id: &str) -> Result<Option<GateConfig>> {
        match self.kv.get(&Self::gate_key(experiment_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_gate(&self, experiment_id: &str, config: &GateConfig) -> Result<()> {
        let raw = serde_json::to_vec(config)?;
        self.kv.set(&Self::gate_key(experiment_id), raw, None).await
    }

    pub async fn delete_gate(&self, experiment_id: &str) -> Result<()> {
        self.kv.delete(&Self::gate_key(experiment_id)).await
    }

    /// Remove every runtime key derived from an experiment (used after a
    /// catalog delete).
    pub async fn purge_experiment(&self, experiment_id: &str) -> Result<()> {
        self.kv.delete(&Self::snapshot_key(experiment_id)).await?;
        self.kv.delete(&Self::params_key(experiment_id)).await?;
        self.kv.delete(&Self::gate_key(experiment_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use quiver_core::policy::PolicyRegistry;
    use quiver_core::Pool;
    use serde_json::Map;

    fn snapshot() -> ExperimentSnapshot {
        ExperimentSnapshot {
            id: "e1".into(),
            name: "exp".into(),
            pool: Pool::new("p", vec!["a".into(), "b".into()]),
            policy: "beta_ts".into(),
            policy_params: Map::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let store = RuntimeStore::new(Arc::new(MemoryKvStore::new()));
        let snap = snapshot();
        store.set_snapshot(&snap).await.unwrap();
        let back = store.get_snapshot("e1").await.unwrap().unwrap();
        assert_eq!(back, snap);
    }

    #[tokio::test]
    async fn params_roundtrip_validates() {
        let store = RuntimeStore::new(Arc::new(MemoryKvStore::new()));
        let registry = PolicyRegistry::builtin();
        let policy = registry.get("beta_ts").unwrap();
        let ps = policy.init_params(2, &Map::new()).unwrap();
        store.set_params("e1", &ps, None).await.unwrap();
        let back = store.get_params("e1").await.unwrap().unwrap();
        assert_eq!(back, ps);
    }

    #[tokio::test]
    async fn purge_removes_all_keys() {
        let store = RuntimeStore::new(Arc::new(MemoryKvStore::new()));
        let snap = snapshot();
        store.set_snapshot(&snap).await.unwrap();
        store.set_gate("e1", &Default::default()).await.unwrap();
        store.purge_experiment("e1").await.unwrap();
        assert!(store.get_snapshot("e1").await.unwrap().is_none());
        assert!(store.get_gate("e1").await.unwrap().is_none());
    }
}
