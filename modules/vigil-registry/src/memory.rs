//! In-process Registry used by tests and single-node development runs.
//!
//! Semantics mirror the Redis backend: TTLs expire lazily, locks are
//! token-fenced, and subscribers only see messages published after they
//! subscribed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::{Registry, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    kv: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn kv(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.kv.lock().expect("memory registry kv poisoned")
    }

    /// Drop the key if its TTL has lapsed, then return the live value.
    fn get_live(kv: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match kv.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                kv.remove(key);
                None
            }
            None => None,
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .expect("memory registry topics poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(Self::get_live(&mut self.kv(), key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.kv().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.kv().remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let hashes = self
            .inner
            .hashes
            .lock()
            .expect("memory registry hashes poisoned");
        Ok(hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut hashes = self
            .inner
            .hashes
            .lock()
            .expect("memory registry hashes poisoned");
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut hashes = self
            .inner
            .hashes
            .lock()
            .expect("memory registry hashes poisoned");
        if let Some(hash) = hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let hashes = self
            .inner
            .hashes
            .lock()
            .expect("memory registry hashes poisoned");
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut kv = self.kv();
        kv.retain(|_, entry| entry.live());
        Ok(kv
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut kv = self.kv();
        match Self::get_live(&mut kv, key) {
            Some(holder) if holder != token => Ok(false),
            _ => {
                kv.insert(
                    key.to_string(),
                    Entry {
                        value: token.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut kv = self.kv();
        match Self::get_live(&mut kv, key) {
            Some(holder) if holder == token => {
                kv.insert(
                    key.to_string(),
                    Entry {
                        value: token.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut kv = self.kv();
        match Self::get_live(&mut kv, key) {
            Some(holder) if holder == token => {
                kv.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error, matching Redis.
        let _ = self.sender_for(topic).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>> {
        let mut source = self.sender_for(topic).subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Minimal glob matcher: `*` matches any run of characters.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn inner(p: &[u8], c: &[u8]) -> bool {
        match (p.first(), c.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], c) || (!c.is_empty() && inner(p, &c[1..]))
            }
            (Some(pc), Some(cc)) if pc == cc => inner(&p[1..], &c[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefix_patterns() {
        assert!(glob_match("cluster:execution_flag:*", "cluster:execution_flag:n1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(!glob_match("a*c", "abd"));
        assert!(!glob_match("cluster:*", "other:key"));
    }
}
