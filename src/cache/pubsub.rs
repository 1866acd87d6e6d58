//! Redis pub/sub frame broker
//!
//! Every process publishes JSON [`FrameEnvelope`]s on one channel and runs a
//! single listener task that re-broadcasts them locally. Origin filtering is up
//! to the subscriber, which knows its own instance id.

use crate::core::{CacheError, FrameBroker, FrameEnvelope, SockError};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const FRAME_CHANNEL: &str = "socket_topic_frames";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Aborts the listener once the last broker clone is dropped
struct ListenerGuard(JoinHandle<()>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    local: broadcast::Sender<FrameEnvelope>,
    listener: Arc<ListenerGuard>,
}

impl RedisBroker {
    /// Connect and start the listener task
    pub async fn connect(client: Client, capacity: usize) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        let (local, _) = broadcast::channel(capacity);
        let listener = tokio::spawn(listen(client, local.clone()));

        Ok(Self {
            conn,
            local,
            listener: Arc::new(ListenerGuard(listener)),
        })
    }

    pub fn shutdown(&self) {
        self.listener.0.abort();
    }
}

async fn listen(client: Client, local: broadcast::Sender<FrameEnvelope>) {
    loop {
        match forward(&client, &local).await {
            Ok(()) => tracing::warn!(channel = FRAME_CHANNEL, "pub/sub stream ended, reconnecting"),
            Err(e) => tracing::warn!(
                channel = FRAME_CHANNEL,
                error = %e,
                "pub/sub listener failed, reconnecting"
            ),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn forward(
    client: &Client,
    local: &broadcast::Sender<FrameEnvelope>,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(FRAME_CHANNEL).await?;
    tracing::debug!(channel = FRAME_CHANNEL, "listening for remote frames");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable pub/sub payload");
                continue;
            }
        };
        match serde_json::from_str::<FrameEnvelope>(&payload) {
            Ok(envelope) => {
                let _ = local.send(envelope);
            }
            Err(e) => tracing::warn!(error = %e, "dropping malformed frame envelope"),
        }
    }
    Ok(())
}

#[async_trait]
impl FrameBroker for RedisBroker {
    async fn publish(&self, envelope: FrameEnvelope) -> Result<(), SockError> {
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| SockError::Internal(format!("encoding envelope: {}", e)))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(FRAME_CHANNEL, payload)
            .await
            .map_err(CacheError::from)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameEnvelope> {
        self.local.subscribe()
    }
}
