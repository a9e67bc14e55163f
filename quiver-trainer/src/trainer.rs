//! Batched parameter updates: group a batch by experiment, load the current
//! state, fold each event through the policy's update rule in stream order,
//! write back.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use quiver_core::error::Result;
use quiver_core::policy::PolicyRegistry;
use quiver_core::FeedbackEvent;
use quiver_store::{MessageId, RuntimeStore};

/// Result of one batch: ids safe to ack, per-experiment folded counts,
/// events to retry after a failed write, and unknown-experiment drops.
#[derive(Debug, Default)]
pub struct TrainOutcome {
    pub acked: Vec<MessageId>,
    pub trained: HashMap<String, usize>,
    pub retry: Vec<(MessageId, FeedbackEvent)>,
    pub dropped_unknown: usize,
}

pub struct BatchTrainer {
    runtime: RuntimeStore,
    registry: Arc<PolicyRegistry>,
}

impl BatchTrainer {
    pub fn new(runtime: RuntimeStore, registry: Arc<PolicyRegistry>) -> Self {
        Self { runtime, registry }
    }

    /// Process a batch. An unknown experiment drops (and acks) its events; a
    /// failed params write keeps the experiment's events unacked for retry;
    /// neither poisons the rest of the batch.
    pub async fn train_batch(&self, batch: Vec<(MessageId, FeedbackEvent)>) -> TrainOutcome {
        // Group by experiment, preserving arrival order within and across
        // groups.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<(MessageId, FeedbackEvent)>> = HashMap::new();
        for (id, event) in batch {
            let key = event.experiment_id.clone();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push((id, event));
        }

        let mut outcome = TrainOutcome::default();
        for experiment_id in order {
            let events = groups.remove(&experiment_id).unwrap_or_default();
            let ids: Vec<MessageId> = events.iter().map(|(id, _)| *id).collect();
            match self.train_experiment(&experiment_id, &events).await {
                Ok(Some(folded)) => {
                    outcome.acked.extend(ids);
                    *outcome.trained.entry(experiment_id).or_insert(0) += folded;
                }
                Ok(None) => {
                    // Experiment vanished from the runtime store: drop the
                    // events but still ack so they stop redelivering.
                    warn!(
                        %experiment_id,
                        dropped = ids.len(),
                        "dropping events for unknown experiment"
                    );
                    outcome.dropped_unknown += ids.len();
                    outcome.acked.extend(ids);
                }
                Err(e) => {
                    warn!(%experiment_id, error = %e, "batch apply failed; leaving events unacked");
                    outcome.retry.extend(events);
                }
            }
        }
        outcome
    }

    /// Fold one experiment's events. `Ok(None)` means the experiment (or its
    /// policy) is unknown. The params write happens once per group, after the
    /// fold.
    async fn train_experiment(
        &self,
        experiment_id: &str,
        events: &[(MessageId, FeedbackEvent)],
    ) -> Result<Option<usize>> {
        let Some(snapshot) = self.runtime.get_snapshot(experiment_id).await? else {
            return Ok(None);
        };
        let Some(policy) = self.registry.get(&snapshot.policy) else {
            warn!(
                experiment_id,
                policy = %snapshot.policy,
                "snapshot names unregistered policy"
            );
            return Ok(None);
        };

        let mut params = match self.runtime.get_params(experiment_id).await? {
            Some(params) => params,
            None => policy.init_params(snapshot.num_arms(), &snapshot.policy_params)?,
        };

        let mut folded = 0usize;
        for (id, event) in events {
            match policy.train(&params, &event.context(), event.arm_index, event.reward) {
                Ok(next) => {
                    params = next;
                    folded += 1;
                }
                Err(e) => {
                    // A malformed event (bad arm index, wrong context dim)
                    // is skipped without poisoning its batch.
                    warn!(experiment_id, message_id = %id, error = %e, "skipping untrainable event");
                }
            }
        }

        self.runtime.set_params(experiment_id, &params, None).await?;
        Ok(Some(folded))
    }
}
