use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::context::Context;

/// Reward event published by the proxy and consumed by the trainer.
/// Immutable once published; delivered at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub experiment_id: String,
    pub request_id: String,
    pub arm_index: usize,
    pub reward: f64,
    pub context_id: String,
    #[serde(default)]
    pub context_vector: Vec<f64>,
    #[serde(default)]
    pub context_metadata: HashMap<String, String>,
    pub timestamp_ms: i64,
}

impl FeedbackEvent {
    /// Reconstruct the selection-time context for training.
    pub fn context(&self) -> Context {
        Context {
            id: self.context_id.clone(),
            vector: self.context_vector.clone(),
            metadata: self.context_metadata.clone(),
        }
    }
}
