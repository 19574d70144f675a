//! The shared Registry: durable KV, hashes, pattern scan, pub/sub topics,
//! and a distributed mutex.
//!
//! The cluster core talks to this narrow interface only. Production runs on
//! Redis ([`RedisRegistry`]); tests run on the in-process
//! [`MemoryRegistry`], which honors the same TTL, lock, and pub/sub
//! semantics.

pub mod error;
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::RegistryError;
pub use memory::MemoryRegistry;
pub use self::redis::RedisRegistry;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry operations required by the cluster core.
///
/// Implementations must be safe to share across tasks. None of these calls
/// may be made while holding a process-local lock; callers own that rule.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a key, optionally with a TTL after which it expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// All keys matching a glob-style pattern (`*` wildcards).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Try to take the named mutex. Returns false when another holder owns
    /// it. Re-acquiring with the same token refreshes the TTL.
    async fn lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Refresh the mutex TTL. Returns false when the caller is no longer
    /// the owner (expired or taken over).
    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release the mutex. Returns false when the caller was not the owner.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Subscribe to a topic. Messages arrive on the returned channel until
    /// it is dropped. Subscribers only see messages published after the
    /// subscription is established.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>>;
}
