//! Cross-process participant index
//!
//! Two families of sets, both TTL-refreshed on every [`CacheIndex::track`]:
//!
//! - `participant_topics:<topic>` holds socket ids joined to a topic
//! - `socket_id:<socket-id>:topics` holds the `participant_topics:*` keys a socket joined
//!
//! plus `socket_server_connections`, the set of sockets registered by any
//! process, cleared when a process initializes.
//!
//! The index is eventually consistent. Teardown untracks explicitly; the TTL
//! only bounds how long a crashed process can leave stale entries behind.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod pubsub;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use pubsub::RedisBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

use crate::core::{CacheError, Participants, SocketId, Targets};
use async_trait::async_trait;
use indexmap::IndexMap;

pub const SERVER_CONNECTIONS_KEY: &str = "socket_server_connections";
pub const PARTICIPANT_TOPICS_PREFIX: &str = "participant_topics:";

/// Default TTL for participant sets
pub const DEFAULT_TRACK_TTL_SECS: u64 = 86_400;

pub fn participant_topics_key(topic: &str) -> Result<String, CacheError> {
    if topic.is_empty() {
        return Err(CacheError::MalformedKey(topic.to_string()));
    }
    Ok(format!("{PARTICIPANT_TOPICS_PREFIX}{topic}"))
}

pub fn socket_topics_key(socket_id: &SocketId) -> Result<String, CacheError> {
    if socket_id.user_sub.is_empty() || socket_id.connection_id.is_empty() {
        return Err(CacheError::MalformedKey(socket_id.to_string()));
    }
    Ok(format!("socket_id:{socket_id}:topics"))
}

/// Inverse of [`participant_topics_key`]
pub fn topic_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(PARTICIPANT_TOPICS_PREFIX)
        .filter(|t| !t.is_empty())
}

/// Remaining connection ids per topic after a socket left
pub type RemovedTopics = IndexMap<String, Targets>;

/// Shared presence index
#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// Clear the server connection set; run once per process start
    async fn init_keys(&self) -> Result<(), CacheError>;

    /// Add a freshly opened socket to the server connection set
    async fn register_socket(&self, socket_id: &SocketId) -> Result<(), CacheError>;

    async fn is_registered(&self, socket_id: &SocketId) -> Result<bool, CacheError>;

    /// Join `socket_id` to `topic` in both directions and refresh the TTL
    async fn track(&self, topic: &str, socket_id: &SocketId) -> Result<(), CacheError>;

    /// Remove `socket_id` from `topic` in both directions; idempotent
    async fn untrack(&self, socket_id: &SocketId, topic: &str) -> Result<(), CacheError>;

    async fn has_tracking(&self, topic: &str, socket_id: &SocketId) -> Result<bool, CacheError>;

    /// Remove a disconnected socket from every topic and from the server set
    ///
    /// Returns the connection ids still present on each topic it left; topics
    /// that became empty are omitted.
    async fn handle_unsub(&self, socket_id: &SocketId) -> Result<RemovedTopics, CacheError>;

    /// Socket ids on `topic`
    async fn members(&self, topic: &str) -> Result<Vec<SocketId>, CacheError>;

    /// Topics `socket_id` is tracked on
    async fn socket_topics(&self, socket_id: &SocketId) -> Result<Vec<String>, CacheError>;

    /// Participants on `topic`, grouped by user, all online
    async fn participants(&self, topic: &str) -> Result<Participants, CacheError> {
        let members = self.members(topic).await?;
        Ok(Participants::from_socket_ids(&members))
    }

    /// Connection ids on `topic`
    async fn participant_targets(&self, topic: &str) -> Result<Targets, CacheError> {
        let members = self.members(topic).await?;
        Ok(members.into_iter().map(|sid| sid.connection_id).collect())
    }
}

/// Parse stored members, skipping anything that is not a socket id
pub(crate) fn parse_members<I, S>(raw: I) -> Vec<SocketId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|m| m.as_ref().parse::<SocketId>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(
            participant_topics_key("exchange/0:X").unwrap(),
            "participant_topics:exchange/0:X"
        );
        let sid = SocketId::new("alice", "0195ec07-e989-71ac-a0c4-f6a08d1f93f6");
        assert_eq!(
            socket_topics_key(&sid).unwrap(),
            "socket_id:alice:0195ec07-e989-71ac-a0c4-f6a08d1f93f6:topics"
        );
        assert!(participant_topics_key("").is_err());
        assert!(socket_topics_key(&SocketId::new("", "c")).is_err());
    }

    #[test]
    fn test_topic_from_key() {
        assert_eq!(
            topic_from_key("participant_topics:exchange/0:X"),
            Some("exchange/0:X")
        );
        assert_eq!(topic_from_key("participant_topics:"), None);
        assert_eq!(topic_from_key("socket_id:x"), None);
    }

    #[test]
    fn test_parse_members_skips_garbage() {
        let good = "alice:0195ec07-e989-71ac-a0c4-f6a08d1f93f6";
        let members = parse_members([good, "junk"]);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_sub, "alice");
    }
}
