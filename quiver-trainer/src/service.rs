//! Consumer-loop service: recovery of unacked deliveries, steady-state
//! batch/flush cycle, stats ledger, and a command channel for forced
//! flushes.
//!
//! The pending buffer is owned by the loop task; other tasks reach it only
//! through commands. The loop polls the stream first (the consume future
//! cancels safely only while idle-waiting), drains commands between polls,
//! and acks a batch strictly after its params write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use quiver_core::error::{Error, Result};
use quiver_core::policy::PolicyRegistry;
use quiver_core::FeedbackEvent;
use quiver_store::{FeedbackStream, MessageId, RuntimeStore};

use crate::config::TrainerConfig;
use crate::trainer::BatchTrainer;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const RECOVERY_STALL_LIMIT: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentStats {
    pub experiment_id: String,
    pub total: u64,
    pub pending: u64,
    pub last_train_ms: i64,
}

enum Command {
    Flush {
        experiment_id: Option<String>,
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Default)]
struct Ledger {
    total: u64,
    last_train_ms: i64,
}

pub struct TrainerService {
    stream: Arc<dyn FeedbackStream>,
    trainer: BatchTrainer,
    config: TrainerConfig,
    totals: DashMap<String, Ledger>,
    buffered: DashMap<String, u64>,
    dropped_unknown: AtomicU64,
    command_tx: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl TrainerService {
    pub fn new(
        stream: Arc<dyn FeedbackStream>,
        runtime: RuntimeStore,
        registry: Arc<PolicyRegistry>,
        config: TrainerConfig,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(16);
        Arc::new(Self {
            stream,
            trainer: BatchTrainer::new(runtime, registry),
            config,
            totals: DashMap::new(),
            buffered: DashMap::new(),
            dropped_unknown: AtomicU64::new(0),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        })
    }

    /// Consumer loop. Runs until `shutdown` flips, then flushes what is
    /// buffered and returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut commands) = self.command_rx.lock().take() else {
            error!("trainer loop started twice");
            return;
        };

        self.recover().await;

        let group = self.config.consumer_group.clone();
        let consumer = self.config.consumer_name.clone();
        let block = Duration::from_millis(self.config.batch_timeout_ms);
        let flush_interval = Duration::from_secs(self.config.flush_interval_secs);

        let mut buffer: Vec<(MessageId, FeedbackEvent)> = Vec::new();
        let mut last_flush = Instant::now();

        info!(
            %group,
            %consumer,
            batch_size = self.config.batch_size,
            "starting feedback consumer loop"
        );
        loop {
            while let Ok(command) = commands.try_recv() {
                self.handle_command(command, &mut buffer).await;
                last_flush = Instant::now();
            }
            if *shutdown.borrow() {
                break;
            }

            let remaining = self.config.batch_size.saturating_sub(buffer.len());
            tokio::select! {
                biased;
                result = self.stream.consume(&group, &consumer, remaining, block) => {
                    match result {
                        Ok(messages) => {
                            buffer.extend(messages);
                            self.update_pending_gauge(&buffer);
                        }
                        Err(e) => {
                            error!(error = %e, "consume failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown.changed() => break,
                command = commands.recv() => {
                    if let Some(command) = command {
                        self.handle_command(command, &mut buffer).await;
                        last_flush = Instant::now();
                    }
                }
            }

            if buffer.len() >= self.config.batch_size || last_flush.elapsed() >= flush_interval {
                self.flush_buffer(&mut buffer, None).await;
                last_flush = Instant::now();
            }
        }

        info!(buffered = buffer.len(), "trainer shutting down, flushing");
        self.flush_buffer(&mut buffer, None).await;
        info!(
            dropped_unknown = self.unknown_experiment_count(),
            "consumer loop stopped"
        );
    }

    /// Drain messages delivered to this consumer before a previous crash.
    async fn recover(&self) {
        let group = self.config.consumer_group.clone();
        let consumer = self.config.consumer_name.clone();
        let mut stalls = 0u32;
        loop {
            let pending = match self.stream.pending_count(&group).await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "pending count failed during recovery");
                    return;
                }
            };
            if pending == 0 {
                break;
            }
            info!(pending, "recovering unacked messages");
            let claimed = match self
                .stream
                .claim_pending(&group, &consumer, self.config.batch_size, Duration::ZERO)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "claim failed during recovery");
                    return;
                }
            };
            if claimed.is_empty() {
                break;
            }
            let mut batch = claimed;
            let processed = self.apply_batch(&mut batch).await;
            if processed == 0 && !batch.is_empty() {
                stalls += 1;
                if stalls >= RECOVERY_STALL_LIMIT {
                    warn!(
                        remaining = batch.len(),
                        "recovery stalled; leaving messages pending"
                    );
                    break;
                }
            }
        }
    }

    async fn handle_command(
        &self,
        command: Command,
        buffer: &mut Vec<(MessageId, FeedbackEvent)>,
    ) {
        match command {
            Command::Flush {
                experiment_id,
                reply,
            } => {
                let processed = self.flush_buffer(buffer, experiment_id).await;
                let _ = reply.send(processed);
            }
        }
    }

    /// Flush buffered events (optionally a single experiment's). Returns the
    /// number of events folded. Events whose apply failed go back into the
    /// buffer for the next attempt.
    async fn flush_buffer(
        &self,
        buffer: &mut Vec<(MessageId, FeedbackEvent)>,
        experiment_id: Option<String>,
    ) -> usize {
        let mut batch = match experiment_id {
            None => std::mem::take(buffer),
            Some(id) => {
                let (matching, rest) = std::mem::take(buffer)
                    .into_iter()
                    .partition(|(_, event)| event.experiment_id == id);
                *buffer = rest;
                matching
            }
        };
        let processed = self.apply_batch(&mut batch).await;
        // Whatever could not be applied is retried on the next flush.
        buffer.extend(batch);
        self.update_pending_gauge(buffer);
        processed
    }

    /// Run one batch through the trainer, ack what was applied, record
    /// stats. On return `batch` holds only the events left to retry.
    async fn apply_batch(&self, batch: &mut Vec<(MessageId, FeedbackEvent)>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let taken = std::mem::take(batch);
        let count = taken.len();
        let outcome = self.trainer.train_batch(taken).await;

        // Ack only after the params writes succeeded; an unacked message is
        // redelivered and retrained (at-least-once).
        if !outcome.acked.is_empty() {
            if let Err(e) = self
                .stream
                .ack(&self.config.consumer_group, &outcome.acked)
                .await
            {
                error!(error = %e, "ack failed; events may be retrained after restart");
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut processed = 0usize;
        for (experiment_id, folded) in &outcome.trained {
            processed += folded;
            let mut entry = self.totals.entry(experiment_id.clone()).or_default();
            entry.total += *folded as u64;
            entry.last_train_ms = now_ms;
        }
        if outcome.dropped_unknown > 0 {
            self.dropped_unknown
                .fetch_add(outcome.dropped_unknown as u64, Ordering::Relaxed);
        }
        if !outcome.retry.is_empty() {
            warn!(retrying = outcome.retry.len(), "events left for retry");
        }
        info!(
            events = count,
            trained = processed,
            experiments = outcome.trained.len(),
            "flushed batch"
        );

        *batch = outcome.retry;
        processed
    }

    fn update_pending_gauge(&self, buffer: &[(MessageId, FeedbackEvent)]) {
        self.buffered.clear();
        for (_, event) in buffer {
            *self.buffered.entry(event.experiment_id.clone()).or_insert(0) += 1;
        }
    }

    /// Force a flush through the consumer loop.
    pub async fn flush_batch(&self, experiment_id: Option<String>) -> Result<usize> {
        let (reply, receiver) = oneshot::channel();
        self.command_tx
            .send(Command::Flush {
                experiment_id,
                reply,
            })
            .await
            .map_err(|_| Error::Unavailable("trainer consumer loop is not running".into()))?;
        receiver
            .await
            .map_err(|_| Error::Internal("trainer flush reply dropped".into()))
    }

    pub fn get_stats(&self, experiment_id: Option<&str>) -> Vec<ExperimentStats> {
        let snapshot = |id: &str| {
            let (total, last_train_ms) = self
                .totals
                .get(id)
                .map(|e| (e.total, e.last_train_ms))
                .unwrap_or((0, 0));
            ExperimentStats {
                experiment_id: id.to_string(),
                total,
                pending: self.buffered.get(id).map(|v| *v).unwrap_or(0),
                last_train_ms,
            }
        };
        match experiment_id {
            Some(id) => {
                if self.totals.contains_key(id) || self.buffered.contains_key(id) {
                    vec![snapshot(id)]
                } else {
                    Vec::new()
                }
            }
            None => {
                let mut ids: Vec<String> = self.totals.iter().map(|e| e.key().clone()).collect();
                for entry in self.buffered.iter() {
                    if !ids.contains(entry.key()) {
                        ids.push(entry.key().clone());
                    }
                }
                ids.sort_unstable();
                ids.iter().map(|id| snapshot(id)).collect()
            }
        }
    }

    /// Events dropped because their experiment no longer exists.
    pub fn unknown_experiment_count(&self) -> u64 {
        self.dropped_unknown.load(Ordering::Relaxed)
    }

    pub async fn health(&self) -> bool {
        self.stream.len().await.is_ok()
    }
}
