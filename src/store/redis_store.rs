// =============================================================================
// RedisKv — production KvStore backed by redis
// =============================================================================
//
// Commands go through a ConnectionManager (auto-reconnecting multiplexed
// connection). Each subscribe() opens a dedicated pub/sub connection and
// forwards messages into an mpsc channel; the forwarding task exits when the
// receiver is dropped or the connection dies.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KvStore, PubSubMessage};
use crate::error::{EngineError, EngineResult};

pub struct RedisKv {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
}

impl RedisKv {
    /// Connect to redis and verify the connection with a PING.
    pub async fn connect(url: &str, prefix: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::Internal(format!("redis url: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EngineError::Internal(format!("redis connect: {e}")))?;

        let store = Self {
            client,
            manager,
            prefix: prefix.to_string(),
        };
        store.ping().await?;
        debug!(prefix = %store.prefix, "redis connected");
        Ok(store)
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn store_err(e: redis::RedisError) -> EngineError {
    EngineError::Internal(format!("redis: {e}"))
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut con = self.manager.clone();
        con.get(self.key(key)).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.set(self.key(key), value).await.map_err(store_err)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.set_ex(self.key(key), value, ttl_secs)
            .await
            .map_err(store_err)
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.del(self.key(key)).await.map_err(store_err)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.hset_multiple(self.key(key), fields)
            .await
            .map_err(store_err)
    }

    async fn hash_get_all(&self, key: &str) -> EngineResult<HashMap<String, String>> {
        let mut con = self.manager.clone();
        con.hgetall(self.key(key)).await.map_err(store_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.sadd(self.key(key), member).await.map_err(store_err)
    }

    async fn set_remove(&self, key: &str, member: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.srem(self.key(key), member).await.map_err(store_err)
    }

    async fn set_members(&self, key: &str) -> EngineResult<Vec<String>> {
        let mut con = self.manager.clone();
        con.smembers(self.key(key)).await.map_err(store_err)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.zadd(self.key(key), member, score)
            .await
            .map_err(store_err)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.zrem(self.key(key), member).await.map_err(store_err)
    }

    async fn zset_range_desc(
        &self,
        key: &str,
        limit: usize,
    ) -> EngineResult<Vec<(String, f64)>> {
        let mut con = self.manager.clone();
        let stop = limit.saturating_sub(1) as isize;
        con.zrevrange_withscores(self.key(key), 0, stop)
            .await
            .map_err(store_err)
    }

    async fn zset_score(&self, key: &str, member: &str) -> EngineResult<Option<f64>> {
        let mut con = self.manager.clone();
        con.zscore(self.key(key), member).await.map_err(store_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.publish(self.key(channel), payload)
            .await
            .map_err(store_err)
    }

    async fn subscribe(
        &self,
        patterns: &[String],
    ) -> EngineResult<mpsc::Receiver<PubSubMessage>> {
        let con = self
            .client
            .get_async_connection()
            .await
            .map_err(store_err)?;
        let mut pubsub = con.into_pubsub();

        for pattern in patterns {
            pubsub
                .psubscribe(self.key(pattern))
                .await
                .map_err(store_err)?;
        }

        let (tx, rx) = mpsc::channel(256);
        let prefix = self.prefix.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let full_channel = msg.get_channel_name().to_string();
                let channel = full_channel
                    .strip_prefix(&prefix)
                    .and_then(|s| s.strip_prefix(':'))
                    .unwrap_or(&full_channel)
                    .to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, channel, "non-utf8 pub/sub payload dropped");
                        continue;
                    }
                };
                if tx.send(PubSubMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            debug!("pub/sub forwarding task ended");
        });

        Ok(rx)
    }

    async fn ping(&self) -> EngineResult<()> {
        let mut con = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut con)
            .await
            .map(|_| ())
            .map_err(store_err)
    }
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv")
            .field("prefix", &self.prefix)
            .finish()
    }
}
