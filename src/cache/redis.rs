//! Redis-backed cache index
//!
//! Uses the async [`ConnectionManager`], which reconnects on its own; every
//! failure surfaces as [`CacheError::Backend`] and is never fatal to callers.

use super::{
    CacheIndex, DEFAULT_TRACK_TTL_SECS, RemovedTopics, SERVER_CONNECTIONS_KEY, parse_members,
    participant_topics_key, socket_topics_key, topic_from_key,
};
use crate::core::{CacheError, SocketId, Targets};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo};
use std::path::Path;

/// Build connection info from `REDIS_URL` style input and an optional password file
///
/// Accepts a full `redis://` URL or a bare `host:port`. Only the first line of
/// the password file is used.
pub fn connection_info(url: &str, pass_file: Option<&Path>) -> Result<ConnectionInfo, CacheError> {
    let url = if url.contains("://") {
        url.to_string()
    } else {
        format!("redis://{url}")
    };
    let mut info = url.as_str().into_connection_info()?;

    if let Some(path) = pass_file {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Backend(format!("reading {}: {}", path.display(), e))
        })?;
        let password = contents.lines().next().unwrap_or_default().trim();
        if !password.is_empty() {
            info.redis.password = Some(password.to_string());
        }
    }

    Ok(info)
}

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    ttl_secs: i64,
}

impl RedisCache {
    pub async fn connect(client: Client) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            ttl_secs: DEFAULT_TRACK_TTL_SECS as i64,
        })
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs as i64;
        self
    }
}

#[async_trait]
impl CacheIndex for RedisCache {
    async fn init_keys(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(SERVER_CONNECTIONS_KEY).await?;
        Ok(())
    }

    async fn register_socket(&self, socket_id: &SocketId) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(SERVER_CONNECTIONS_KEY, socket_id.to_string())
            .await?;
        Ok(())
    }

    async fn is_registered(&self, socket_id: &SocketId) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn
            .sismember(SERVER_CONNECTIONS_KEY, socket_id.to_string())
            .await?)
    }

    async fn track(&self, topic: &str, socket_id: &SocketId) -> Result<(), CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let socket_key = socket_topics_key(socket_id)?;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .sadd(&topic_key, socket_id.to_string())
            .ignore()
            .expire(&topic_key, self.ttl_secs)
            .ignore()
            .sadd(&socket_key, &topic_key)
            .ignore()
            .expire(&socket_key, self.ttl_secs)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn untrack(&self, socket_id: &SocketId, topic: &str) -> Result<(), CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let socket_key = socket_topics_key(socket_id)?;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .srem(&topic_key, socket_id.to_string())
            .ignore()
            .srem(&socket_key, &topic_key)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn has_tracking(&self, topic: &str, socket_id: &SocketId) -> Result<bool, CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let socket_key = socket_topics_key(socket_id)?;
        let mut conn = self.conn.clone();
        Ok(conn.sismember(socket_key, topic_key).await?)
    }

    async fn handle_unsub(&self, socket_id: &SocketId) -> Result<RemovedTopics, CacheError> {
        let socket_key = socket_topics_key(socket_id)?;
        let member = socket_id.to_string();
        let mut conn = self.conn.clone();

        conn.srem::<_, _, ()>(SERVER_CONNECTIONS_KEY, &member).await?;

        let topic_keys: Vec<String> = conn.smembers(&socket_key).await?;
        let mut removed = RemovedTopics::new();

        for topic_key in topic_keys {
            if let Err(e) = conn.srem::<_, _, ()>(&topic_key, &member).await {
                tracing::warn!(key = %topic_key, error = %e, "failed to remove socket from topic");
                continue;
            }

            let members: Vec<String> = match conn.smembers(&topic_key).await {
                Ok(members) => members,
                Err(e) => {
                    tracing::warn!(
                        key = %topic_key,
                        error = %e,
                        "failed to read remaining members"
                    );
                    continue;
                }
            };

            let remaining: Targets = parse_members(members)
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

        conn.del::<_, ()>(&socket_key).await?;
        Ok(removed)
    }

    async fn members(&self, topic: &str) -> Result<Vec<SocketId>, CacheError> {
        let topic_key = participant_topics_key(topic)?;
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(topic_key).await?;
        Ok(parse_members(members))
    }

    async fn socket_topics(&self, socket_id: &SocketId) -> Result<Vec<String>, CacheError> {
        let socket_key = socket_topics_key(socket_id)?;
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(socket_key).await?;
        Ok(keys
            .iter()
            .filter_map(|k| topic_from_key(k).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bare_host_port_becomes_url() {
        let info = connection_info("localhost:6379", None).unwrap();
        assert_eq!(info.redis.password, None);
        assert_eq!(info.redis.db, 0);
    }

    #[test]
    fn test_password_file_first_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "s3cret").unwrap();
        writeln!(file, "ignored").unwrap();

        let info = connection_info("redis://localhost:6379", Some(file.path())).unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_missing_password_file() {
        let err = connection_info("localhost:6379", Some(Path::new("/nonexistent/redis_pass")))
            .unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
    }
}
