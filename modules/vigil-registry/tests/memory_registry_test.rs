//! Semantics shared by every Registry backend, exercised on the in-memory
//! implementation: TTL expiry, token-fenced locking, and pub/sub delivery.

use std::time::Duration;

use vigil_registry::{MemoryRegistry, Registry};

#[tokio::test]
async fn kv_set_get_del() {
    let reg = MemoryRegistry::new();
    reg.set("k", "v", None).await.unwrap();
    assert_eq!(reg.get("k").await.unwrap().as_deref(), Some("v"));
    reg.del("k").await.unwrap();
    assert_eq!(reg.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn ttl_expires_keys() {
    let reg = MemoryRegistry::new();
    reg.set("short", "v", Some(Duration::from_millis(30)))
        .await
        .unwrap();
    assert!(reg.get("short").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(reg.get("short").await.unwrap(), None);
    // Expired keys also vanish from pattern scans
    assert!(reg.keys("short*").await.unwrap().is_empty());
}

#[tokio::test]
async fn hashes_are_independent_of_kv() {
    let reg = MemoryRegistry::new();
    reg.hset("h", "a", "1").await.unwrap();
    reg.hset("h", "b", "2").await.unwrap();
    assert_eq!(reg.hget("h", "a").await.unwrap().as_deref(), Some("1"));
    assert_eq!(reg.get("h").await.unwrap(), None);

    let all = reg.hgetall("h").await.unwrap();
    assert_eq!(all.len(), 2);

    reg.hdel("h", "a").await.unwrap();
    assert_eq!(reg.hget("h", "a").await.unwrap(), None);
}

#[tokio::test]
async fn lock_is_exclusive_and_token_fenced() {
    let reg = MemoryRegistry::new();
    let ttl = Duration::from_secs(5);

    assert!(reg.lock("lk", "alice", ttl).await.unwrap());
    assert!(!reg.lock("lk", "bob", ttl).await.unwrap());

    // Holder can refresh; a stranger cannot extend or release.
    assert!(reg.extend_lock("lk", "alice", ttl).await.unwrap());
    assert!(!reg.extend_lock("lk", "bob", ttl).await.unwrap());
    assert!(!reg.unlock("lk", "bob").await.unwrap());

    assert!(reg.unlock("lk", "alice").await.unwrap());
    assert!(reg.lock("lk", "bob", ttl).await.unwrap());
}

#[tokio::test]
async fn lock_expires_after_ttl() {
    let reg = MemoryRegistry::new();
    assert!(reg
        .lock("lk", "alice", Duration::from_millis(30))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(60)).await;
    // Lease lapsed: the holder can no longer extend, a new node can take it.
    assert!(!reg
        .extend_lock("lk", "alice", Duration::from_secs(1))
        .await
        .unwrap());
    assert!(reg.lock("lk", "bob", Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn pubsub_delivers_to_live_subscribers_only() {
    let reg = MemoryRegistry::new();

    // Published before subscribing: never seen.
    reg.publish("topic", "early").await.unwrap();

    let mut sub = reg.subscribe("topic").await.unwrap();
    reg.publish("topic", "hello").await.unwrap();
    reg.publish("topic", "world").await.unwrap();

    assert_eq!(sub.recv().await.unwrap(), "hello");
    assert_eq!(sub.recv().await.unwrap(), "world");
}

#[tokio::test]
async fn registry_clone_shares_state() {
    let reg = MemoryRegistry::new();
    let other = reg.clone();
    reg.set("shared", "yes", None).await.unwrap();
    assert_eq!(other.get("shared").await.unwrap().as_deref(), Some("yes"));
}
