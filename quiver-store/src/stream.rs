//! Durable feedback stream with consumer-group semantics.
//!
//! Append-only entries under monotone u64 ids, a per-group read cursor, and
//! a per-group pending table tracking delivered-but-unacked messages. Acking
//! also deletes the entry to bound storage. Delivery is at-least-once:
//! anything consumed but not acked stays claimable after a crash.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use quiver_core::error::{Error, Result};
use quiver_core::FeedbackEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait FeedbackStream: Send + Sync {
    /// Append an event. The stream is bounded by an approximate maximum
    /// length; the oldest entries are discarded on overflow.
    async fn publish(&self, event: &FeedbackEvent) -> Result<MessageId>;

    /// Blocking read of entries not yet delivered to `group`. Returns early
    /// when messages are available; otherwise waits up to `block` for a
    /// publish before re-reading once.
    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(MessageId, FeedbackEvent)>>;

    /// Messages delivered to `group` but not yet acked.
    async fn pending_count(&self, group: &str) -> Result<usize>;

    /// Re-deliver unacked messages idle for at least `min_idle`, reassigning
    /// them to `consumer`. Used to drain work stranded by a crash.
    async fn claim_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<(MessageId, FeedbackEvent)>>;

    /// Acknowledge and delete.
    async fn ack(&self, group: &str, ids: &[MessageId]) -> Result<()>;

    async fn len(&self) -> Result<usize>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingEntry {
    consumer: String,
    delivered_at_ms: i64,
    delivery_count: u32,
}

pub struct SledFeedbackStream {
    db: sled::Db,
    entries: sled::Tree,
    cursors: sled::Tree,
    pending: sled::Tree,
    max_len: usize,
    // sled's Tree::len is O(n); the bound is allowed to be approximate.
    approx_len: AtomicUsize,
    notify: Notify,
    // Serializes cursor advancement and trims; publish/read bodies are short.
    lock: Mutex<()>,
}

impl SledFeedbackStream {
    pub fn open(db: &sled::Db, name: &str, max_len: usize) -> Result<Self> {
        let open = |suffix: &str| {
            db.open_tree(format!("stream:{name}:{suffix}"))
                .map_err(|e| Error::Storage(e.to_string()))
        };
        let entries = open("entries")?;
        let approx_len = AtomicUsize::new(entries.len());
        Ok(Self {
            db: db.clone(),
            entries,
            cursors: open("cursors")?,
            pending: open("pending")?,
            max_len,
            approx_len,
            notify: Notify::new(),
            lock: Mutex::new(()),
        })
    }

    fn pending_key(group: &str, id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(group.len() + 9);
        key.extend_from_slice(group.as_bytes());
        key.push(0);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn pending_prefix(group: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(group.len() + 1);
        prefix.extend_from_slice(group.as_bytes());
        prefix.push(0);
        prefix
    }

    fn id_from_pending_key(group: &str, key: &[u8]) -> Option<u64> {
        let tail = key.get(group.len() + 1..)?;
        let bytes: [u8; 8] = tail.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    fn storage(e: sled::Error) -> Error {
        Error::Storage(e.to_string())
    }

    fn read_event(&self, id: u64) -> Result<Option<FeedbackEvent>> {
        let Some(raw) = self.entries.get(id.to_be_bytes()).map_err(Self::storage)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                warn!(id, error = %e, "dropping undecodable stream entry");
                Ok(None)
            }
        }
    }

    fn deliver(&self, group: &str, consumer: &str, id: u64, delivery_count: u32) -> Result<()> {
        let entry = PendingEntry {
            consumer: consumer.to_string(),
            delivered_at_ms: Utc::now().timestamp_millis(),
            delivery_count,
        };
        self.pending
            .insert(Self::pending_key(group, id), serde_json::to_vec(&entry)?)
            .map_err(Self::storage)?;
        Ok(())
    }

    fn read_new(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(MessageId, FeedbackEvent)>> {
        let _guard = self.lock.lock();
        let cursor = self
            .cursors
            .get(group.as_bytes())
            .map_err(Self::storage)?
            .and_then(|raw| raw.as_ref().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0);

        let mut out = Vec::new();
        let mut next_cursor = cursor;
        for item in self.entries.range(cursor.to_be_bytes()..) {
            if out.len() >= count {
                break;
            }
            let (key, raw) = item.map_err(Self::storage)?;
            let bytes: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| Error::Storage("malformed stream entry key".into()))?;
            let id = u64::from_be_bytes(bytes);
            next_cursor = id + 1;
            match serde_json::from_slice::<FeedbackEvent>(&raw) {
                Ok(event) => {
                    self.deliver(group, consumer, id, 1)?;
                    out.push((MessageId(id), event));
                }
                Err(e) => {
                    warn!(id, error = %e, "skipping undecodable stream entry");
                }
            }
        }
        if next_cursor != cursor {
            self.cursors
                .insert(group.as_bytes(), &next_cursor.to_be_bytes()[..])
                .map_err(Self::storage)?;
        }
        Ok(out)
    }

    fn trim(&self) -> Result<()> {
        // Approximate bound: drop oldest entries beyond max_len.
        while self.approx_len.load(Ordering::Relaxed) > self.max_len {
            match self.entries.iter().next() {
                Some(item) => {
                    let (key, _) = item.map_err(Self::storage)?;
                    self.entries.remove(key).map_err(Self::storage)?;
                    self.approx_len.fetch_sub(1, Ordering::Relaxed);
                }
                None => {
                    self.approx_len.store(0, Ordering::Relaxed);
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FeedbackStream for SledFeedbackStream {
    async fn publish(&self, event: &FeedbackEvent) -> Result<MessageId> {
        let raw = serde_json::to_vec(event)?;
        let id = {
            let _guard = self.lock.lock();
            let id = self.db.generate_id().map_err(Self::storage)?;
            self.entries
                .insert(id.to_be_bytes(), raw)
                .map_err(Self::storage)?;
            self.approx_len.fetch_add(1, Ordering::Relaxed);
            self.trim()?;
            id
        };
        self.notify.notify_waiters();
        Ok(MessageId(id))
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(MessageId, FeedbackEvent)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let notified = self.notify.notified();
        let messages = self.read_new(group, consumer, count)?;
        if !messages.is_empty() || block.is_zero() {
            return Ok(messages);
        }
        let _ = tokio::time::timeout(block, notified).await;
        self.read_new(group, consumer, count)
    }

    async fn pending_count(&self, group: &str) -> Result<usize> {
        Ok(self.pending.scan_prefix(Self::pending_prefix(group)).count())
    }

    async fn claim_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<(MessageId, FeedbackEvent)>> {
        let now_ms = Utc::now().timestamp_millis();
        let min_idle_ms = min_idle.as_millis() as i64;
        let mut out = Vec::new();
        for item in self.pending.scan_prefix(Self::pending_prefix(group)) {
            if out.len() >= count {
                break;
            }
            let (key, raw) = item.map_err(Self::storage)?;
            let Some(id) = Self::id_from_pending_key(group, &key) else {
                continue;
            };
            let entry: PendingEntry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(_) => {
                    self.pending.remove(key).map_err(Self::storage)?;
                    continue;
                }
            };
            if now_ms - entry.delivered_at_ms < min_idle_ms {
                continue;
            }
            match self.read_event(id)? {
                Some(event) => {
                    self.deliver(group, consumer, id, entry.delivery_count + 1)?;
                    out.push((MessageId(id), event));
                }
                None => {
                    // Entry trimmed or deleted from under the pending table.
                    self.pending.remove(key).map_err(Self::storage)?;
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, group: &str, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            self.pending
                .remove(Self::pending_key(group, id.0))
                .map_err(Self::storage)?;
            // Delete acked entries to bound storage.
            let removed = self
                .entries
                .remove(id.0.to_be_bytes())
                .map_err(Self::storage)?;
            if removed.is_some() {
                self.approx_len.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.approx_len.load(Ordering::Relaxed))
    }
}
