//! Key-value store behind the runtime snapshot and parameter state.
//!
//! `SledKvStore` is the durable embedded engine; `MemoryKvStore` backs unit
//! tests. Expiry is an 8-byte big-endian deadline prefix on the stored value,
//! enforced lazily on read.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::time::Instant;

use quiver_core::error::{Error, Result};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Last-writer-wins; `ttl` of `None` means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct SledKvStore {
    tree: sled::Tree,
}

impl SledKvStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db
            .open_tree("kv")
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { tree })
    }

    fn encode(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
        let deadline_ms: u64 = match ttl {
            Some(ttl) => (Utc::now().timestamp_millis() as u64).saturating_add(ttl.as_millis() as u64),
            None => 0,
        };
        let mut buf = Vec::with_capacity(8 + value.len());
        buf.extend_from_slice(&deadline_ms.to_be_bytes());
        buf.extend_from_slice(value);
        buf
    }

    fn decode(raw: &[u8]) -> Option<(u64, Vec<u8>)> {
        if raw.len() < 8 {
            return None;
        }
        let mut deadline = [0u8; 8];
        deadline.copy_from_slice(&raw[..8]);
        Some((u64::from_be_bytes(deadline), raw[8..].to_vec()))
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = self
            .tree
            .get(key.as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let Some((deadline_ms, value)) = Self::decode(&raw) else {
            return Ok(None);
        };
        if deadline_ms != 0 && (Utc::now().timestamp_millis() as u64) > deadline_ms {
            let _ = self.tree.remove(key.as_bytes());
            return Ok(None);
        }
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.tree
            .insert(key.as_bytes(), Self::encode(&value, ttl))
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, (Option<Instant>, Vec<u8>)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            let (deadline, value) = entry.value();
            if let Some(deadline) = deadline {
                if Instant::now() > *deadline {
                    drop(entry);
                    self.entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), (deadline, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
