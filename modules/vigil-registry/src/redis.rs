//! Redis-backed Registry.
//!
//! Commands go through a [`ConnectionManager`] (auto-reconnecting); each
//! subscription runs its own pub/sub connection with a forwarding task that
//! exits when the subscriber side is dropped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script, SetExpiry, SetOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Registry, RegistryError, Result};

/// Compare-token-then-extend. KEYS[1]=lock, ARGV[1]=token, ARGV[2]=ttl ms.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Compare-token-then-delete. KEYS[1]=lock, ARGV[1]=token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

pub struct RedisRegistry {
    client: Client,
    manager: ConnectionManager,
}

impl RedisRegistry {
    /// Connect and verify the server responds before returning.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            Client::open(url).map_err(|e| RegistryError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;

        let mut conn = manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;

        debug!(url, "Connected to registry");
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let opts =
                    SetOptions::default().with_expiration(SetExpiry::PX(ttl.as_millis() as u64));
                let _: () = conn.set_options(key, value, opts).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: () = self.conn().hdel(key, field).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        // SCAN rather than KEYS: the registry is shared with live traffic.
        let mut conn = self.conn();
        let mut out = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            out.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        // NX set; on failure check whether we already own it (re-entry
        // refreshes the TTL).
        let opts = SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl.as_millis() as u64));
        let acquired: Option<String> = conn.set_options(key, token, opts).await?;
        if acquired.is_some() {
            return Ok(true);
        }
        let holder: Option<String> = conn.get(key).await?;
        if holder.as_deref() == Some(token) {
            return self.extend_lock(key, token, ttl).await;
        }
        Ok(false)
    }

    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let _: () = self.conn().publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let topic = topic.to_string();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(topic, error = %e, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Subscriber dropped; tear the connection down.
                    break;
                }
            }
            debug!(topic, "Subscription closed");
        });
        Ok(rx)
    }
}
