use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request context passed to selection and training.
///
/// Stochastic and adversarial policies only look at `id` (via the feature
/// gate's rollout hash) and ignore the vector; contextual policies require
/// `vector` to match their configured dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(default)]
    pub vector: Vec<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Context {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vector: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_vector(mut self, vector: Vec<f64>) -> Self {
        self.vector = vector;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}
