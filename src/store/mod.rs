// =============================================================================
// KV Store Adapter — typed access to the ordered key-value store
// =============================================================================
//
// The engine persists through this narrow trait: hashes, sets, sorted sets,
// JSON blobs, TTL, and pub/sub. `RedisKv` is the production implementation;
// `MemoryKv` backs tests. Key prefixing happens inside the implementations so
// callers only ever see logical keys ("coin:btcidr", "bot:<id>", ...).
// =============================================================================

mod redis_store;

pub use redis_store::RedisKv;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};

/// A message delivered from a pub/sub subscription. The channel name is the
/// logical (unprefixed) one.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Storage interface for everything the engine persists.
#[async_trait]
pub trait KvStore: Send + Sync {
    // ── Strings / JSON blobs ────────────────────────────────────────────
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> EngineResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<()>;

    // ── Hashes ──────────────────────────────────────────────────────────
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()>;
    async fn hash_get_all(&self, key: &str) -> EngineResult<HashMap<String, String>>;

    // ── Sets ────────────────────────────────────────────────────────────
    async fn set_add(&self, key: &str, member: &str) -> EngineResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> EngineResult<()>;
    async fn set_members(&self, key: &str) -> EngineResult<Vec<String>>;

    // ── Sorted sets ─────────────────────────────────────────────────────
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> EngineResult<()>;
    async fn zset_remove(&self, key: &str, member: &str) -> EngineResult<()>;
    /// Members with scores, highest score first, at most `limit`.
    async fn zset_range_desc(&self, key: &str, limit: usize)
        -> EngineResult<Vec<(String, f64)>>;
    async fn zset_score(&self, key: &str, member: &str) -> EngineResult<Option<f64>>;

    // ── Pub/sub ─────────────────────────────────────────────────────────
    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()>;
    /// Subscribe to the given channel patterns (trailing `*` wildcard
    /// supported). Messages arrive on the returned receiver until it is
    /// dropped.
    async fn subscribe(&self, patterns: &[String]) -> EngineResult<mpsc::Receiver<PubSubMessage>>;

    // ── Liveness ────────────────────────────────────────────────────────
    async fn ping(&self) -> EngineResult<()>;
}

// =============================================================================
// JSON helpers
// =============================================================================

/// Fetch and deserialize a JSON blob.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> EngineResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Internal(format!("decode {key}: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and store a JSON blob.
pub async fn put_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> EngineResult<()> {
    let raw = serde_json::to_string(value)
        .map_err(|e| EngineError::Internal(format!("encode {key}: {e}")))?;
    store.set(key, &raw).await
}

/// `true` if `channel` matches `pattern` (exact, or prefix when the pattern
/// ends in `*`).
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

// =============================================================================
// MemoryKv — in-memory implementation used by tests
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, Vec<String>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    subscribers: Vec<(Vec<String>, mpsc::Sender<PubSubMessage>)>,
}

/// In-memory `KvStore`. TTLs are accepted and ignored — test runs are far
/// shorter than any TTL the engine sets.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.inner.lock().strings.insert(key.into(), value.into());
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> EngineResult<()> {
        self.set(key, value).await
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.into()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> EngineResult<HashMap<String, String>> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let set = inner.sets.entry(key.into()).or_default();
        if !set.iter().any(|m| m == member) {
            set.push(member.into());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> EngineResult<()> {
        if let Some(set) = self.inner.lock().sets.get_mut(key) {
            set.retain(|m| m != member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> EngineResult<Vec<String>> {
        Ok(self.inner.lock().sets.get(key).cloned().unwrap_or_default())
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> EngineResult<()> {
        self.inner
            .lock()
            .zsets
            .entry(key.into())
            .or_default()
            .insert(member.into(), score);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> EngineResult<()> {
        if let Some(zset) = self.inner.lock().zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zset_range_desc(
        &self,
        key: &str,
        limit: usize,
    ) -> EngineResult<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        let mut entries: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn zset_score(&self, key: &str, member: &str) -> EngineResult<Option<f64>> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .and_then(|z| z.get(member).copied()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        let msg = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|(patterns, tx)| {
            if patterns.iter().any(|p| pattern_matches(p, channel)) {
                // A full or closed receiver drops the subscriber.
                tx.try_send(msg.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[String],
    ) -> EngineResult<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().subscribers.push((patterns.to_vec(), tx));
        Ok(rx)
    }

    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
