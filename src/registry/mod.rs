//! Subscriber registry
//!
//! The authoritative per-process record of tickets, live connections and which
//! of a user's connections joined which topic. State is mutated only by a fixed
//! pool of workers draining bounded command queues; callers hold a cheap
//! [`Registry`] handle and await one reply per command.
//!
//! # Dispatch
//!
//! ```text
//! caller ──▶ queue[hash(client_id) % N] ──▶ worker ──▶ RegistryState::apply
//!   ▲                                                        │
//!   └──────────────────── oneshot reply ◀────────────────────┘
//! ```
//!
//! Both the send and the reply wait are bounded by the command timeout.

pub mod command;
pub mod pool;
pub mod state;

pub use command::{
    Command, Frame, FrameSender, RegistryStats, Response, SendReport, SweepReport,
};
pub use state::{PendingTicket, Subscriber};

use crate::core::{RegistryError, SessionIdentity, Targets, Ticket};
use command::Request;
use state::RegistryState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub workers: usize,
    pub buffer: usize,
    pub timeout: Duration,
    pub ticket_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            buffer: 10,
            timeout: Duration::from_secs(5),
            ticket_ttl: Duration::from_secs(60),
        }
    }
}

/// Handle to the worker pool; clones share the same pool
#[derive(Clone)]
pub struct Registry {
    queues: Arc<[mpsc::Sender<Request>]>,
    next: Arc<AtomicUsize>,
    handles: Arc<Vec<JoinHandle<()>>>,
    config: RegistryConfig,
}

impl Registry {
    /// Start the worker pool on the current runtime
    pub fn start(config: RegistryConfig) -> Self {
        let workers = config.workers.max(1);
        let state = Arc::new(Mutex::new(RegistryState::default()));
        let (queues, handles) = pool::spawn(workers, config.buffer, state);
        tracing::debug!(workers, buffer = config.buffer, "registry started");

        Self {
            queues: queues.into(),
            next: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(handles),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Stop every worker; pending requests fail with a closed channel
    pub fn shutdown(&self) {
        for handle in self.handles.iter() {
            handle.abort();
        }
    }

    fn queue_for(&self, client_id: Option<&str>) -> &mpsc::Sender<Request> {
        let index = match client_id {
            Some(id) => pool::route(id, self.queues.len()),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len(),
        };
        &self.queues[index]
    }

    /// Send a command and wait for its reply, both under the command timeout
    pub async fn dispatch(
        &self,
        client_id: Option<&str>,
        command: Command,
    ) -> Result<Response, RegistryError> {
        let (reply, rx) = oneshot::channel();
        let request = Request {
            client_id: client_id.map(str::to_string),
            command,
            reply,
        };

        let queue = self.queue_for(client_id);
        match tokio::time::timeout(self.config.timeout, queue.send(request)).await {
            Err(_) => return Err(RegistryError::SendTimeout),
            Ok(Err(_)) => return Err(RegistryError::ChannelClosed),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Err(_) => Err(RegistryError::ReceiveTimeout),
            Ok(Err(_)) => Err(RegistryError::ChannelClosed),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn create_ticket(&self, session: &SessionIdentity) -> Result<Ticket, RegistryError> {
        let command = Command::CreateTicket {
            session: session.clone(),
        };
        match self.dispatch(Some(&session.sub), command).await? {
            Response::Ticket(ticket) => Ok(ticket),
            _ => Err(RegistryError::UnexpectedReply("create_ticket")),
        }
    }

    /// Consume `ticket` and register the connection's write half
    pub async fn create_connection(
        &self,
        user_sub: &str,
        ticket: &Ticket,
        sender: FrameSender,
    ) -> Result<Subscriber, RegistryError> {
        let command = Command::CreateConnection {
            user_sub: user_sub.to_string(),
            ticket: ticket.clone(),
            sender,
            ticket_ttl: self.config.ticket_ttl,
        };
        match self.dispatch(Some(user_sub), command).await? {
            Response::Subscriber(subscriber) => Ok(*subscriber),
            _ => Err(RegistryError::UnexpectedReply("create_connection")),
        }
    }

    pub async fn delete_connection(
        &self,
        user_sub: &str,
        connection_id: &str,
    ) -> Result<(), RegistryError> {
        let command = Command::DeleteConnection {
            user_sub: user_sub.to_string(),
            connection_id: connection_id.to_string(),
        };
        self.dispatch(Some(user_sub), command).await.map(|_| ())
    }

    /// The subscriber holding an unconsumed ticket with this auth nonce
    pub async fn get_subscriber(&self, auth: &str) -> Result<Subscriber, RegistryError> {
        let command = Command::GetSubscriber {
            auth: auth.to_string(),
            ticket_ttl: self.config.ticket_ttl,
        };
        match self.dispatch(None, command).await? {
            Response::Subscriber(subscriber) => Ok(*subscriber),
            _ => Err(RegistryError::UnexpectedReply("get_subscriber")),
        }
    }

    /// Write `frame` to every local connection in `targets`
    pub async fn send_message(
        &self,
        targets: &Targets,
        frame: Frame,
    ) -> Result<SendReport, RegistryError> {
        let command = Command::SendMessage {
            targets: targets.clone(),
            frame,
        };
        match self.dispatch(None, command).await? {
            Response::Sent(report) => Ok(report),
            _ => Err(RegistryError::UnexpectedReply("send_message")),
        }
    }

    pub async fn add_subscribed_topic(
        &self,
        user_sub: &str,
        topic: &str,
        targets: &Targets,
    ) -> Result<(), RegistryError> {
        let command = Command::AddSubscribedTopic {
            user_sub: user_sub.to_string(),
            topic: topic.to_string(),
            targets: targets.clone(),
        };
        self.dispatch(Some(user_sub), command).await.map(|_| ())
    }

    /// Every live connection id of the user in this process
    pub async fn get_subscribed_targets(&self, user_sub: &str) -> Result<Targets, RegistryError> {
        let command = Command::GetSubscribedTargets {
            user_sub: user_sub.to_string(),
        };
        self.expect_targets(Some(user_sub), command, "get_subscribed_targets")
            .await
    }

    pub async fn delete_subscribed_topic(
        &self,
        user_sub: &str,
        topic: &str,
        connection_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let command = Command::DeleteSubscribedTopic {
            user_sub: user_sub.to_string(),
            topic: topic.to_string(),
            connection_id: connection_id.map(str::to_string),
        };
        self.dispatch(Some(user_sub), command).await.map(|_| ())
    }

    pub async fn has_subscribed_topic(
        &self,
        user_sub: &str,
        topic: &str,
        connection_id: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let command = Command::HasSubscribedTopic {
            user_sub: user_sub.to_string(),
            topic: topic.to_string(),
            connection_id: connection_id.map(str::to_string),
        };
        match self.dispatch(Some(user_sub), command).await? {
            Response::Bool(has) => Ok(has),
            _ => Err(RegistryError::UnexpectedReply("has_subscribed_topic")),
        }
    }

    /// Local connections joined to `topic`, across all users
    pub async fn get_topic_targets(&self, topic: &str) -> Result<Targets, RegistryError> {
        let command = Command::GetTopicTargets {
            topic: topic.to_string(),
        };
        self.expect_targets(None, command, "get_topic_targets").await
    }

    /// Local connections of every subscriber in `group_id`
    pub async fn get_group_targets(&self, group_id: &str) -> Result<Targets, RegistryError> {
        let command = Command::GetGroupTargets {
            group_id: group_id.to_string(),
        };
        self.expect_targets(None, command, "get_group_targets").await
    }

    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        match self.dispatch(None, Command::Stats).await? {
            Response::Stats(stats) => Ok(stats),
            _ => Err(RegistryError::UnexpectedReply("stats")),
        }
    }

    /// Drop expired tickets and subscribers left with nothing
    pub async fn sweep(&self) -> Result<SweepReport, RegistryError> {
        let command = Command::Sweep {
            ticket_ttl: self.config.ticket_ttl,
        };
        match self.dispatch(None, command).await? {
            Response::Swept(report) => Ok(report),
            _ => Err(RegistryError::UnexpectedReply("sweep")),
        }
    }

    async fn expect_targets(
        &self,
        client_id: Option<&str>,
        command: Command,
        name: &'static str,
    ) -> Result<Targets, RegistryError> {
        match self.dispatch(client_id, command).await? {
            Response::Targets(targets) => Ok(targets),
            _ => Err(RegistryError::UnexpectedReply(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::start(RegistryConfig {
            workers: 4,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_ticket_handshake_roundtrip() {
        let registry = registry();
        let session = SessionIdentity::new("alice", "g1", "");
        let ticket = registry.create_ticket(&session).await.unwrap();

        let subscriber = registry.get_subscriber(&ticket.auth).await.unwrap();
        assert_eq!(subscriber.user_sub(), "alice");

        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriber = registry.create_connection("alice", &ticket, tx).await.unwrap();
        assert!(subscriber.connection_ids.contains(&ticket.connection_id));

        assert!(matches!(
            registry.get_subscriber(&ticket.auth).await,
            Err(RegistryError::SubscriberNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_ticket_use_has_one_winner() {
        let registry = registry();
        let session = SessionIdentity::new("alice", "g1", "");
        let ticket = registry.create_ticket(&session).await.unwrap();

        let attempts = (0..8).map(|_| {
            let registry = registry.clone();
            let ticket = ticket.clone();
            tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                registry.create_connection("alice", &ticket, tx).await.is_ok()
            })
        });

        let mut wins = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            if attempt.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_send_message_without_targets() {
        let registry = registry();
        assert_eq!(
            registry
                .send_message(&Targets::new(), Frame::from(&b"x"[..]))
                .await,
            Err(RegistryError::NoTargets)
        );
    }

    #[tokio::test]
    async fn test_topic_membership_flow() {
        let registry = registry();
        let session = SessionIdentity::new("alice", "g1", "");
        let ticket = registry.create_ticket(&session).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.create_connection("alice", &ticket, tx).await.unwrap();
        let conn = ticket.connection_id.as_str();

        let targets = registry.get_subscribed_targets("alice").await.unwrap();
        registry
            .add_subscribed_topic("alice", "exchange/0:X", &targets)
            .await
            .unwrap();
        assert!(
            registry
                .has_subscribed_topic("alice", "exchange/0:X", Some(conn))
                .await
                .unwrap()
        );

        let topic_targets = registry.get_topic_targets("exchange/0:X").await.unwrap();
        registry
            .send_message(&topic_targets, Frame::from(&b"hello"[..]))
            .await
            .unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), b"hello");

        registry
            .delete_subscribed_topic("alice", "exchange/0:X", None)
            .await
            .unwrap();
        assert!(
            !registry
                .has_subscribed_topic("alice", "exchange/0:X", None)
                .await
                .unwrap()
        );

        registry.delete_connection("alice", conn).await.unwrap();
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.connections, 0);
    }

    /// A registry whose single queue nobody drains
    fn stalled(timeout: Duration) -> (Registry, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(1);
        let registry = Registry {
            queues: vec![tx].into(),
            next: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(Vec::new()),
            config: RegistryConfig {
                workers: 1,
                buffer: 1,
                timeout,
                ticket_ttl: Duration::from_secs(60),
            },
        };
        (registry, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_then_send_timeout() {
        let (registry, _queue) = stalled(Duration::from_millis(50));

        // fills the only slot; no worker ever replies
        let err = registry.stats().await.unwrap_err();
        assert_eq!(err, RegistryError::ReceiveTimeout);
        assert_eq!(err.to_string(), "timed out when receiving command");

        let err = registry.stats().await.unwrap_err();
        assert_eq!(err, RegistryError::SendTimeout);
        assert_eq!(err.to_string(), "timed out when sending command");
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let registry = registry();
        registry.shutdown();
        tokio::task::yield_now().await;

        let err = registry.stats().await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ChannelClosed | RegistryError::SendTimeout
        ));
    }
}
