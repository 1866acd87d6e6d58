//! Server host shared by every exposure
//!
//! The host owns nothing but references: the registry handle, the cache index,
//! the message store, the frame broker and the session provider. Exposures
//! (REST ticket endpoint, WebSocket orchestrator) sequence calls through it.
//!
//! # Delivery
//!
//! ```text
//! fan_out(topic) ──▶ cache targets ∪ registry topic targets
//!                          │
//!                  Registry::send_message ──▶ local sockets
//!                          │
//!              FrameBroker::publish(remaining) ──▶ other processes
//! ```

use crate::cache::CacheIndex;
use crate::config::SockConfig;
use crate::core::{
    FrameBroker, FrameEnvelope, Participants, SessionIdentity, SessionProvider, SockError,
    SocketAction, SocketMessage, Targets, Ticket,
};
use crate::registry::{Frame, Registry, SendReport};
use crate::storage::MessageStore;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

/// Host context containing all messaging state handles
pub struct SockHost {
    pub config: Arc<SockConfig>,
    pub registry: Registry,
    pub cache: Arc<dyn CacheIndex>,
    pub store: Arc<dyn MessageStore>,
    pub broker: Arc<dyn FrameBroker>,
    pub sessions: Arc<dyn SessionProvider>,
    instance_id: Uuid,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SockHost {
    /// Build the host and start the registry workers
    pub fn from_builder_components(
        config: SockConfig,
        cache: Arc<dyn CacheIndex>,
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn FrameBroker>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        let registry = Registry::start(config.registry_config());
        Self {
            config: Arc::new(config),
            registry,
            cache,
            store,
            broker,
            sessions,
            instance_id: Uuid::new_v4(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Tags this process's broker envelopes
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Startup housekeeping: drop orphaned connection rows and reset the server set
    pub async fn init(&self) -> Result<(), SockError> {
        let removed = self.store.cleanup_orphans().await?;
        self.cache.init_keys().await?;
        tracing::info!(
            instance_id = %self.instance_id,
            orphaned_connections = removed,
            "messaging host initialized"
        );
        Ok(())
    }

    /// Start the broker listener and the periodic registry report
    pub fn start_background(&self) {
        let listener = tokio::spawn(run_broker_listener(
            self.registry.clone(),
            self.instance_id,
            self.broker.subscribe(),
        ));
        let reporter = tokio::spawn(run_report(
            self.registry.clone(),
            self.config.report_interval(),
        ));

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(listener);
        tasks.push(reporter);
    }

    /// Stop background tasks and registry workers
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        self.registry.shutdown();
    }

    pub async fn issue_ticket(&self, session: &SessionIdentity) -> Result<Ticket, SockError> {
        let ticket = self.registry.create_ticket(session).await?;
        tracing::debug!(
            user_sub = %session.sub,
            connection_id = %ticket.connection_id,
            "ticket issued"
        );
        Ok(ticket)
    }

    /// Write `frame` to `targets`: local ones directly, the rest through the broker
    pub async fn deliver(
        &self,
        topic: &str,
        targets: &Targets,
        frame: Frame,
    ) -> Result<SendReport, SockError> {
        if targets.is_empty() {
            return Ok(SendReport::default());
        }

        let report = self.registry.send_message(targets, frame.clone()).await?;

        let mut remote = targets.clone();
        remote.retain(|id| !report.sent.contains(id) && !report.failed.contains(id));
        if !remote.is_empty() {
            self.publish(topic, remote, &frame).await;
        }
        Ok(report)
    }

    /// Every connection on `topic` across the deployment
    ///
    /// The boolean is false when the cache could not be read and only local
    /// targets are known.
    pub async fn topic_targets(&self, topic: &str) -> Result<(Targets, bool), SockError> {
        let local = self.registry.get_topic_targets(topic).await?;
        match self.cache.participant_targets(topic).await {
            Ok(cached) => Ok((cached.union(&local), true)),
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "participant cache unavailable");
                Ok((local, false))
            }
        }
    }

    /// Send `frame` to every participant of `topic`
    pub async fn fan_out(&self, topic: &str, frame: Frame) -> Result<SendReport, SockError> {
        let (targets, complete) = self.topic_targets(topic).await?;
        let report = self.deliver(topic, &targets, frame.clone()).await?;
        if !complete {
            // other processes resolve the topic against their own registries
            self.publish(topic, Targets::new(), &frame).await;
        }
        Ok(report)
    }

    async fn publish(&self, topic: &str, targets: Targets, frame: &Frame) {
        let envelope = FrameEnvelope::new(self.instance_id, topic, targets, frame.to_vec());
        if let Err(e) = self.broker.publish(envelope).await {
            tracing::warn!(topic = %topic, error = %e, "failed to publish frame to broker");
        }
    }

    /// Cache presence merged with stored authors, enriched with names and roles
    ///
    /// Cache and store failures degrade to fewer participants.
    pub async fn load_participants(&self, session: &SessionIdentity, topic: &str) -> Participants {
        let mut participants = match self.cache.participants(topic).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "unknown participants");
                Participants::new()
            }
        };

        if let Err(e) = self.store.participants(session, topic, &mut participants).await {
            tracing::warn!(topic = %topic, error = %e, "stored participants unavailable");
        }
        if let Err(e) = self.store.enrich_participants(session, &mut participants).await {
            tracing::warn!(topic = %topic, error = %e, "participant details unavailable");
        }
        participants
    }

    /// Push a fresh participant snapshot to `targets`
    pub async fn push_participants(
        &self,
        session: &SessionIdentity,
        topic: &str,
        targets: &Targets,
    ) -> Result<SendReport, SockError> {
        let participants = self.load_participants(session, topic).await;
        let frame = json_frame(SocketAction::LoadSubscribers, topic, &participants)?;
        self.deliver(topic, targets, frame).await
    }

    /// Ask every local connection of `user_sub` to re-identify
    pub async fn role_call(&self, user_sub: &str) -> Result<SendReport, SockError> {
        let targets = self.registry.get_subscribed_targets(user_sub).await?;
        self.send_role_call(&targets).await
    }

    /// Ask every local connection of a group's users to re-identify
    pub async fn group_role_call(&self, group_id: &str) -> Result<SendReport, SockError> {
        let targets = self.registry.get_group_targets(group_id).await?;
        self.send_role_call(&targets).await
    }

    async fn send_role_call(&self, targets: &Targets) -> Result<SendReport, SockError> {
        if targets.is_empty() {
            return Ok(SendReport::default());
        }
        let frame = encode_frame(&SocketMessage::new(SocketAction::RoleCall, ""))?;
        Ok(self.registry.send_message(targets, frame).await?)
    }
}

impl Drop for SockHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn encode_frame(message: &SocketMessage) -> Result<Frame, SockError> {
    Ok(Frame::from(message.encode()?))
}

/// A server frame whose payload is `value` as JSON
pub(crate) fn json_frame<T: Serialize>(
    action: SocketAction,
    topic: &str,
    value: &T,
) -> Result<Frame, SockError> {
    let message = SocketMessage::new(action, topic)
        .with_json(value)
        .map_err(|e| SockError::Internal(format!("payload serialization failed: {e}")))?;
    encode_frame(&message)
}

async fn run_broker_listener(
    registry: Registry,
    instance_id: Uuid,
    rx: broadcast::Receiver<FrameEnvelope>,
) {
    let mut envelopes = BroadcastStream::new(rx);
    while let Some(next) = envelopes.next().await {
        let envelope = match next {
            Ok(envelope) => envelope,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "broker listener lagged, frames dropped");
                continue;
            }
        };
        if envelope.origin == instance_id {
            continue;
        }

        let targets = if envelope.targets.is_empty() {
            match registry.get_topic_targets(&envelope.topic).await {
                Ok(targets) => targets,
                Err(e) => {
                    tracing::warn!(
                        topic = %envelope.topic,
                        error = %e,
                        "cannot resolve topic targets"
                    );
                    continue;
                }
            }
        } else {
            envelope.targets
        };
        if targets.is_empty() {
            continue;
        }

        if let Err(e) = registry
            .send_message(&targets, Frame::from(envelope.frame))
            .await
        {
            tracing::warn!(topic = %envelope.topic, error = %e, "remote frame delivery failed");
        }
    }
    tracing::debug!("broker listener stopped");
}

async fn run_report(registry: Registry, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let swept = match registry.sweep().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "registry sweep failed");
                continue;
            }
        };
        match registry.stats().await {
            Ok(stats) => tracing::info!(
                subscribers = stats.subscribers,
                connections = stats.connections,
                pending_tickets = stats.pending_tickets,
                topics = stats.topics,
                expired_tickets = swept.expired_tickets,
                dropped_subscribers = swept.dropped_subscribers,
                "registry report"
            ),
            Err(e) => tracing::warn!(error = %e, "registry stats failed"),
        }
    }
}
