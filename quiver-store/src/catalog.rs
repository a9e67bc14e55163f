//! Durable catalog: pools, experiments, and feature gates.
//!
//! Backed by sled trees with name-uniqueness indexes. Writes are serialized
//! by a single lock, making each API call atomic with respect to the others.
//! The catalog is pure CRUD; snapshot publication to the key-value store is
//! the proxy service's job.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use quiver_core::error::{Error, Result};
use quiver_core::gate::GateConfig;
use quiver_core::pool::{Arm, Pool};
use quiver_core::Experiment;

/// Arm description accepted by pool creation; indices are assigned densely
/// in input order.
#[derive(Debug, Clone)]
pub struct ArmSpec {
    pub name: String,
    pub metadata: HashMap<String, String>,
}

/// Partial experiment update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ExperimentUpdate {
    pub name: Option<String>,
    pub policy: Option<String>,
    pub policy_params: Option<Map<String, Value>>,
    pub enabled: Option<bool>,
}

pub struct Catalog {
    pools: sled::Tree,
    pool_names: sled::Tree,
    experiments: sled::Tree,
    experiment_names: sled::Tree,
    gates: sled::Tree,
    write_lock: Mutex<()>,
}

fn storage(e: sled::Error) -> Error {
    Error::Storage(e.to_string())
}

impl Catalog {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let open = |name: &str| db.open_tree(name).map_err(storage);
        Ok(Self {
            pools: open("catalog:pools")?,
            pool_names: open("catalog:pool_names")?,
            experiments: open("catalog:experiments")?,
            experiment_names: open("catalog:experiment_names")?,
            gates: open("catalog:gates")?,
            write_lock: Mutex::new(()),
        })
    }

    // -- pools --------------------------------------------------------------

    pub fn create_pool(&self, name: &str, arms: Vec<ArmSpec>) -> Result<Pool> {
        if arms.is_empty() {
            return Err(Error::InvalidArgument(
                "a pool needs at least one arm".into(),
            ));
        }
        let _guard = self.write_lock.lock();
        if self.pool_names.get(name).map_err(storage)?.is_some() {
            return Err(Error::Conflict(format!("pool name already exists: {name}")));
        }
        let mut pool = Pool::new(name, arms.iter().map(|a| a.name.clone()).collect());
        for (arm, spec) in pool.arms.iter_mut().zip(arms) {
            arm.metadata = spec.metadata;
        }
        self.pools
            .insert(pool.id.as_bytes(), serde_json::to_vec(&pool)?)
            .map_err(storage)?;
        self.pool_names
            .insert(name, pool.id.as_bytes())
            .map_err(storage)?;
        Ok(pool)
    }

    pub fn get_pool(&self, id: &str) -> Result<Pool> {
        match self.pools.get(id.as_bytes()).map_err(storage)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(Error::NotFound(format!("pool not found: {id}"))),
        }
    }

    pub fn delete_pool(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let pool = self.get_pool(id)?;
        // A live experiment keeps its pool alive.
        for item in self.experiments.iter() {
            let (_, raw) = item.map_err(storage)?;
            let experiment: Experiment = serde_json::from_slice(&raw)?;
            if experiment.pool_id == id {
                return Err(Error::Conflict(format!(
                    "pool {id} is referenced by experiment {}",
                    experiment.id
                )));
            }
        }
        self.pools.remove(id.as_bytes()).map_err(storage)?;
        self.pool_names.remove(pool.name).map_err(storage)?;
        Ok(())
    }

    pub fn list_pools(&self, limit: usize, offset: usize) -> Result<Vec<Pool>> {
        let mut pools = Vec::new();
        for item in self.pools.iter() {
            let (_, raw) = item.map_err(storage)?;
            pools.push(serde_json::from_slice::<Pool>(&raw)?);
        }
        pools.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pools.into_iter().skip(offset).take(limit).collect())
    }

    // -- experiments --------------------------------------------------------

    pub fn create_experiment(&self, experiment: Experiment) -> Result<Experiment> {
        let _guard = self.write_lock.lock();
        if self
            .experiment_names
            .get(&experiment.name)
            .map_err(storage)?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "experiment name already exists: {}",
                experiment.name
            )));
        }
        // The pool reference must resolve at creation time.
        self.get_pool(&experiment.pool_id)?;
        self.experiments
            .insert(experiment.id.as_bytes(), serde_json::to_vec(&experiment)?)
            .map_err(storage)?;
        self.experiment_names
            .insert(experiment.name.as_str(), experiment.id.as_bytes())
            .map_err(storage)?;
        Ok(experiment)
    }

    pub fn get_experiment(&self, id: &str) -> Result<Experiment> {
        match self.experiments.get(id.as_bytes()).map_err(storage)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(Error::NotFound(format!("experiment not found: {id}"))),
        }
    }

    pub fn update_experiment(&self, id: &str, update: ExperimentUpdate) -> Result<Experiment> {
        let _guard = self.write_lock.lock();
        let mut experiment = self.get_experiment(id)?;
        if let Some(name) = update.name {
            if name != experiment.name {
                if self.experiment_names.get(&name).map_err(storage)?.is_some() {
                    return Err(Error::Conflict(format!(
                        "experiment name already exists: {name}"
                    )));
                }
                self.experiment_names
                    .remove(experiment.name.as_str())
                    .map_err(storage)?;
                self.experiment_names
                    .insert(name.as_str(), id.as_bytes())
                    .map_err(storage)?;
                experiment.name = name;
            }
        }
        if let Some(policy) = update.policy {
            experiment.policy = policy;
        }
        if let Some(policy_params) = update.policy_params {
            experiment.policy_params = policy_params;
        }
        if let Some(enabled) = update.enabled {
            experiment.enabled = enabled;
        }
        experiment.updated_at = Utc::now();
        self.experiments
            .insert(id.as_bytes(), serde_json::to_vec(&experiment)?)
            .map_err(storage)?;
        Ok(experiment)
    }

    pub fn delete_experiment(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let experiment = self.get_experiment(id)?;
        self.experiments.remove(id.as_bytes()).map_err(storage)?;
        self.experiment_names
            .remove(experiment.name.as_str())
            .map_err(storage)?;
        self.gates.remove(id.as_bytes()).map_err(storage)?;
        Ok(())
    }

    pub fn list_experiments(&self, limit: usize, offset: usize) -> Result<Vec<Experiment>> {
        let mut experiments = Vec::new();
        for item in self.experiments.iter() {
            let (_, raw) = item.map_err(storage)?;
            experiments.push(serde_json::from_slice::<Experiment>(&raw)?);
        }
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments.into_iter().skip(offset).take(limit).collect())
    }

    /// Denormalized read of an experiment with its pool inlined, for
    /// snapshot publication.
    pub fn experiment_with_pool(&self, id: &str) -> Result<(Experiment, Pool)> {
        let experiment = self.get_experiment(id)?;
        let pool = self.get_pool(&experiment.pool_id)?;
        Ok((experiment, pool))
    }

    /// Resolve an arm id inside the experiment's pool (used to validate gate
    /// default/committed arms at write time).
    pub fn resolve_arm(&self, experiment_id: &str, arm_id: &str) -> Result<Arm> {
        let (_, pool) = self.experiment_with_pool(experiment_id)?;
        pool.arm_by_id(arm_id).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "arm {arm_id} does not belong to the pool of experiment {experiment_id}"
            ))
        })
    }

    // -- gates --------------------------------------------------------------

    pub fn create_gate(&self, experiment_id: &str, mut config: GateConfig) -> Result<GateConfig> {
        config.validate()?;
        let _guard = self.write_lock.lock();
        self.get_experiment(experiment_id)?;
        if self
            .gates
            .get(experiment_id.as_bytes())
            .map_err(storage)?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "experiment {experiment_id} already has a gate"
            )));
        }
        config.version = 1;
        config.updated_at = Utc::now();
        self.gates
            .insert(experiment_id.as_bytes(), serde_json::to_vec(&config)?)
            .map_err(storage)?;
        Ok(config)
    }

    pub fn get_gate(&self, experiment_id: &str) -> Result<GateConfig> {
        match self.gates.get(experiment_id.as_bytes()).map_err(storage)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(Error::NotFound(format!(
                "no gate for experiment {experiment_id}"
            ))),
        }
    }

    pub fn update_gate(&self, experiment_id: &str, mut config: GateConfig) -> Result<GateConfig> {
        config.validate()?;
        let _guard = self.write_lock.lock();
        let current = self.get_gate(experiment_id)?;
        config.version = current.version + 1;
        config.updated_at = Utc::now();
        self.gates
            .insert(experiment_id.as_bytes(), serde_json::to_vec(&config)?)
            .map_err(storage)?;
        Ok(config)
    }

    pub fn delete_gate(&self, experiment_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self
            .gates
            .remove(experiment_id.as_bytes())
            .map_err(storage)?
            .is_none()
        {
            return Err(Error::NotFound(format!(
                "no gate for experiment {experiment_id}"
            )));
        }
        Ok(())
    }
}
