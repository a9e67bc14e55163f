use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the alternatives a policy may choose. Policies address arms by
/// `index`, which is dense, contiguous and immutable for the life of the
/// pool. Deactivating an arm keeps it addressable; `num_arms` never shrinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub id: String,
    pub name: String,
    pub index: usize,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Arm {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            index,
            is_active: true,
            metadata: HashMap::new(),
        }
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }
}

/// An ordered collection of arms. Invariant: arm indices form
/// `0..arms.len()` with no gaps and no duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub arms: Vec<Arm>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    /// Build a pool from arm names, assigning dense indices in order.
    pub fn new(name: impl Into<String>, arm_names: Vec<String>) -> Self {
        let now = Utc::now();
        let arms = arm_names
            .into_iter()
            .enumerate()
            .map(|(i, n)| Arm::new(n, i))
            .collect();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            arms,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    /// O(1) lookup by dense index.
    pub fn arm(&self, index: usize) -> Option<&Arm> {
        self.arms.get(index)
    }

    pub fn arm_by_id(&self, id: &str) -> Option<&Arm> {
        self.arms.iter().find(|a| a.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arm> {
        self.arms.iter()
    }

    /// Check the dense-index invariant. Catalog writes reject pools that
    /// fail this.
    pub fn indices_are_dense(&self) -> bool {
        self.arms.iter().enumerate().all(|(i, a)| a.index == i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_assigns_dense_indices() {
        let pool = Pool::new("p", vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(pool.len(), 3);
        assert!(pool.indices_are_dense());
        assert_eq!(pool.arm(1).unwrap().name, "b");
    }

    #[test]
    fn deactivated_arm_stays_addressable() {
        let mut pool = Pool::new("p", vec!["a".into(), "b".into()]);
        pool.arms[0].deactivate();
        assert_eq!(pool.len(), 2);
        assert!(!pool.arm(0).unwrap().is_active);
    }
}
