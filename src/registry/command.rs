//! Registry commands and their replies

use crate::core::{RegistryError, SessionIdentity, Targets, Ticket};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::state::Subscriber;

/// Encoded frames shared between every connection they fan out to
pub type Frame = Arc<[u8]>;

/// Write half of a connection as the registry sees it
pub type FrameSender = mpsc::UnboundedSender<Frame>;

#[derive(Debug)]
pub enum Command {
    CreateTicket {
        session: SessionIdentity,
    },
    CreateConnection {
        user_sub: String,
        ticket: Ticket,
        sender: FrameSender,
        ticket_ttl: Duration,
    },
    DeleteConnection {
        user_sub: String,
        connection_id: String,
    },
    GetSubscriber {
        auth: String,
        ticket_ttl: Duration,
    },
    SendMessage {
        targets: Targets,
        frame: Frame,
    },
    AddSubscribedTopic {
        user_sub: String,
        topic: String,
        targets: Targets,
    },
    GetSubscribedTargets {
        user_sub: String,
    },
    DeleteSubscribedTopic {
        user_sub: String,
        topic: String,
        connection_id: Option<String>,
    },
    HasSubscribedTopic {
        user_sub: String,
        topic: String,
        connection_id: Option<String>,
    },
    GetTopicTargets {
        topic: String,
    },
    GetGroupTargets {
        group_id: String,
    },
    Stats,
    Sweep {
        ticket_ttl: Duration,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateTicket { .. } => "create_ticket",
            Command::CreateConnection { .. } => "create_connection",
            Command::DeleteConnection { .. } => "delete_connection",
            Command::GetSubscriber { .. } => "get_subscriber",
            Command::SendMessage { .. } => "send_message",
            Command::AddSubscribedTopic { .. } => "add_subscribed_topic",
            Command::GetSubscribedTargets { .. } => "get_subscribed_targets",
            Command::DeleteSubscribedTopic { .. } => "delete_subscribed_topic",
            Command::HasSubscribedTopic { .. } => "has_subscribed_topic",
            Command::GetTopicTargets { .. } => "get_topic_targets",
            Command::GetGroupTargets { .. } => "get_group_targets",
            Command::Stats => "stats",
            Command::Sweep { .. } => "sweep",
        }
    }
}

/// Outcome of a fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub total: usize,
    pub sent: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub subscribers: usize,
    pub connections: usize,
    pub pending_tickets: usize,
    pub topics: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_tickets: usize,
    pub dropped_subscribers: usize,
}

#[derive(Debug)]
pub enum Response {
    Ticket(Ticket),
    Subscriber(Box<Subscriber>),
    Ack,
    Sent(SendReport),
    Targets(Targets),
    Bool(bool),
    Stats(RegistryStats),
    Swept(SweepReport),
}

pub type Reply = oneshot::Sender<Result<Response, RegistryError>>;

/// A command on its way to a worker
#[derive(Debug)]
pub struct Request {
    /// Requests with the same client id always land on the same worker
    pub client_id: Option<String>,
    pub command: Command,
    pub reply: Reply,
}
