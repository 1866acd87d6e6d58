//! Cross-process frame delivery
//!
//! The cache index tells a process which connection ids participate in a topic,
//! but only the process holding a connection can write to it. Every outgoing
//! fan-out is therefore also published on a [`FrameBroker`]; each process
//! listens, skips its own envelopes and writes the frame to whichever of the
//! named targets it holds locally.
//!
//! # Architecture
//!
//! ```text
//! process A ──▶ FrameBroker::publish() ──▶ channel ──▶ process B listener ──▶ local sockets
//!                                                 └──▶ process A listener (skips own origin)
//! ```
//!
//! [`LocalBroker`] is a `tokio::sync::broadcast` channel; clones share it, so
//! several hosts in one process (tests, embedded setups) behave like separate
//! processes. The Redis-backed broker lives in `cache::pubsub`.

use super::error::SockError;
use super::targets::Targets;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A frame addressed to a topic's participants in other processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub id: Uuid,
    /// Instance id of the publishing host
    pub origin: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    /// Connection ids to deliver to; empty means every local subscriber of the topic
    pub targets: Targets,
    /// Encoded frame
    pub frame: Vec<u8>,
}

impl FrameEnvelope {
    pub fn new(origin: Uuid, topic: impl Into<String>, targets: Targets, frame: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            timestamp: Utc::now(),
            topic: topic.into(),
            targets,
            frame,
        }
    }
}

/// Pluggable transport between processes
#[async_trait]
pub trait FrameBroker: Send + Sync {
    /// Hand an envelope to every listening process, including this one
    async fn publish(&self, envelope: FrameEnvelope) -> Result<(), SockError>;

    /// Envelopes published after this call
    fn subscribe(&self) -> broadcast::Receiver<FrameEnvelope>;
}

/// In-process broker
#[derive(Debug, Clone)]
pub struct LocalBroker {
    sender: broadcast::Sender<FrameEnvelope>,
}

impl LocalBroker {
    /// `capacity` bounds how far a slow listener may lag before it drops envelopes
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FrameBroker for LocalBroker {
    async fn publish(&self, envelope: FrameEnvelope) -> Result<(), SockError> {
        // no listeners is not an error
        let _ = self.sender.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameEnvelope> {
        self.sender.subscribe()
    }
}
