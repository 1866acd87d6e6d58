//! In-memory cache index for tests and single-process deployments
//!
//! Mirrors the Redis keyspace exactly (key to set of members, per-key expiry)
//! so both backends behave the same under the shared test suite.

use super::{
    CacheIndex, DEFAULT_TRACK_TTL_SECS, RemovedTopics, SERVER_CONNECTIONS_KEY, parse_members,
    participant_topics_key, socket_topics_key, topic_from_key,
};
use crate::core::{CacheError, SocketId, Targets};
use async_trait::async_trait;
use indexmap::IndexSet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Keyspace {
    sets: HashMap<String, IndexSet<String>>,
    expires: HashMap<String, Instant>,
}

impl Keyspace {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expires
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expires.remove(&key);
            self.sets.remove(&key);
        }
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.shift_remove(member);
            if set.is_empty() {
                self.del(key);
            }
        }
    }

    fn del(&mut self, key: &str) {
        self.sets.remove(key);
        self.expires.remove(key);
    }

    fn smembers(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn sismember(&self, key: &str, member: &str) -> bool {
        self.sets.get(key).is_some_and(|s| s.contains(member))
    }

    fn expire(&mut self, key: &str, at: Instant) {
        if self.sets.contains_key(key) {
            self.expires.insert(key.to_string(), at);
        }
    }
}

/// Cache index held in process memory
#[derive(Clone)]
pub struct InMemoryCache {
    keyspace: Arc<RwLock<Keyspace>>,
    ttl: Duration,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_TRACK_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            keyspace: Arc::new(RwLock::new(Keyspace::default())),
            ttl,
        }
    }

    /// Number of live keys, for tests
    pub fn key_count(&self) -> usize {
        self.keyspace
            .write()
            .map(|mut ks| {
                ks.purge_expired(Instant::now());
                ks.sets.len()
            })
            .unwrap_or(0)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Keyspace) -> T) -> Result<T, CacheError> {
        let mut keyspace = self
            .keyspace
            .write()
            .map_err(|e| CacheError::Backend(format!("Failed to acquire write lock: {}", e)))?;
        keyspace.purge_expired(Instant::now());
        Ok(f(&mut keyspace))
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheIndex for InMemoryCache {
    async fn init_keys(&self) -> Result<(), CacheError> {
        self.write(|ks| ks.del(SERVER_CONNECTIONS_KEY))
    }

    async fn register_socket(&self, socket_id: &SocketId) -> Result<(), CacheError> {
        let member = socket_id.to_string();
        self.write(|ks| ks.sadd(SERVER_CONNECTIONS_KEY, &member))
    }

    async fn is_registered(&self, socket_id: &SocketId) -> Result<bool, CacheError> {
        let member = socket_id.to_string();
        self.write(|ks| ks.sismember(SERVER_CONNECTIONS_KEY, &member))
    }

    async fn track(&self, topic: &str, socket_id: &SocketId) -> Result<(), CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let socket_key = socket_topics_key(socket_id)?;
        let member = socket_id.to_string();
        let expires_at = Instant::now() + self.ttl;

        self.write(|ks| {
            ks.sadd(&topic_key, &member);
            ks.expire(&topic_key, expires_at);
            ks.sadd(&socket_key, &topic_key);
            ks.expire(&socket_key, expires_at);
        })
    }

    async fn untrack(&self, socket_id: &SocketId, topic: &str) -> Result<(), CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let socket_key = socket_topics_key(socket_id)?;
        let member = socket_id.to_string();

        self.write(|ks| {
            ks.srem(&topic_key, &member);
            ks.srem(&socket_key, &topic_key);
        })
    }

    async fn has_tracking(&self, topic: &str, socket_id: &SocketId) -> Result<bool, CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let socket_key = socket_topics_key(socket_id)?;
        self.write(|ks| ks.sismember(&socket_key, &topic_key))
    }

    async fn handle_unsub(&self, socket_id: &SocketId) -> Result<RemovedTopics, CacheError> {
        let socket_key = socket_topics_key(socket_id)?;
        let member = socket_id.to_string();

        self.write(|ks| {
            ks.srem(SERVER_CONNECTIONS_KEY, &member);

            let mut removed = RemovedTopics::new();
            for topic_key in ks.smembers(&socket_key) {
                ks.srem(&topic_key, &member);

                let remaining: Targets = parse_members(ks.smembers(&topic_key))
                    .into_iter()
                    .map(|sid| sid.connection_id)
                    .collect();
                if remaining.is_empty() {
                    continue;
                }
                if let Some(topic) = topic_from_key(&topic_key) {
                    removed.insert(topic.to_string(), remaining);
                }
            }

            ks.del(&socket_key);
            removed
        })
    }

    async fn members(&self, topic: &str) -> Result<Vec<SocketId>, CacheError> {
        let topic_key = participant_topics_key(topic)?;
        self.write(|ks| parse_members(ks.smembers(&topic_key)))
    }

    async fn socket_topics(&self, socket_id: &SocketId) -> Result<Vec<String>, CacheError> {
        let socket_key = socket_topics_key(socket_id)?;
        self.write(|ks| {
            ks.smembers(&socket_key)
                .iter()
                .filter_map(|k| topic_from_key(k).map(str::to_string))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "exchange/2:Y";

    fn sid(user: &str, n: u8) -> SocketId {
        SocketId::new(user, format!("0195ec07-e989-71ac-a0c4-f6a08d1f93f{}", n))
    }

    #[tokio::test]
    async fn test_track_indexes_both_directions() {
        let cache = InMemoryCache::new();
        let alice = sid("alice", 1);

        cache.track(TOPIC, &alice).await.unwrap();

        assert!(cache.has_tracking(TOPIC, &alice).await.unwrap());
        assert_eq!(cache.members(TOPIC).await.unwrap(), vec![alice.clone()]);
        assert_eq!(cache.socket_topics(&alice).await.unwrap(), vec![TOPIC]);
    }

    #[tokio::test]
    async fn test_track_then_untrack_leaves_nothing() {
        let cache = InMemoryCache::new();
        let alice = sid("alice", 1);

        cache.track(TOPIC, &alice).await.unwrap();
        cache.untrack(&alice, TOPIC).await.unwrap();
        cache.untrack(&alice, TOPIC).await.unwrap();

        assert!(!cache.has_tracking(TOPIC, &alice).await.unwrap());
        assert_eq!(cache.key_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_unsub_reports_remaining() {
        let cache = InMemoryCache::new();
        let alice = sid("alice", 1);
        let bob = sid("bob", 2);

        cache.register_socket(&bob).await.unwrap();
        cache.track(TOPIC, &alice).await.unwrap();
        cache.track(TOPIC, &bob).await.unwrap();
        cache.track("exchange/0:solo", &bob).await.unwrap();

        let removed = cache.handle_unsub(&bob).await.unwrap();

        assert_eq!(removed.len(), 1);
        assert_eq!(
            removed[TOPIC].iter().collect::<Vec<_>>(),
            vec![alice.connection_id.as_str()]
        );
        assert!(cache.members("exchange/0:solo").await.unwrap().is_empty());
        assert!(!cache.is_registered(&bob).await.unwrap());
        assert!(cache.socket_topics(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_participants_grouped_by_user() {
        let cache = InMemoryCache::new();
        cache.track(TOPIC, &sid("alice", 1)).await.unwrap();
        cache.track(TOPIC, &sid("alice", 2)).await.unwrap();
        cache.track(TOPIC, &sid("bob", 3)).await.unwrap();

        let participants = cache.participants(TOPIC).await.unwrap();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants.get("alice").unwrap().cids.len(), 2);
        assert_eq!(cache.participant_targets(TOPIC).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_init_keys_clears_server_set() {
        let cache = InMemoryCache::new();
        let alice = sid("alice", 1);
        cache.register_socket(&alice).await.unwrap();
        cache.track(TOPIC, &alice).await.unwrap();

        cache.init_keys().await.unwrap();

        assert!(!cache.is_registered(&alice).await.unwrap());
        assert!(cache.has_tracking(TOPIC, &alice).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = InMemoryCache::with_ttl(Duration::from_secs(10));
        let alice = sid("alice", 1);
        cache.track(TOPIC, &alice).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.track(TOPIC, &alice).await.unwrap();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(cache.has_tracking(TOPIC, &alice).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.members(TOPIC).await.unwrap().is_empty());
    }
}
