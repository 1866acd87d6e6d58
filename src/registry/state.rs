//! Subscriber and connection tables
//!
//! Only worker tasks touch this state, one command at a time, through
//! [`RegistryState::apply`]. Every connection id listed under a subscribed
//! topic is also one of the subscriber's live connection ids.

use super::command::{
    Command, Frame, FrameSender, RegistryStats, Response, SendReport, SweepReport,
};
use crate::core::{RegistryError, SessionIdentity, Targets, Ticket};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PendingTicket {
    pub connection_id: String,
    pub issued_at: Instant,
}

/// One user present in this process
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session: SessionIdentity,
    /// auth nonce to intended connection id
    pub tickets: HashMap<String, PendingTicket>,
    pub connection_ids: Targets,
    pub subscribed_topics: IndexMap<String, Targets>,
}

impl Subscriber {
    fn new(session: SessionIdentity) -> Self {
        Self {
            session,
            tickets: HashMap::new(),
            connection_ids: Targets::new(),
            subscribed_topics: IndexMap::new(),
        }
    }

    pub fn user_sub(&self) -> &str {
        &self.session.sub
    }

    fn splice_connection(&mut self, connection_id: &str) {
        self.connection_ids.remove(connection_id);
        self.subscribed_topics.retain(|_, targets| {
            targets.remove(connection_id);
            !targets.is_empty()
        });
    }
}

struct LocalConnection {
    user_sub: String,
    sender: FrameSender,
}

#[derive(Default)]
pub struct RegistryState {
    subscribers: HashMap<String, Subscriber>,
    connections: HashMap<String, LocalConnection>,
    #[cfg(test)]
    panic_on: Option<&'static str>,
}

impl RegistryState {
    pub fn apply(&mut self, command: Command) -> Result<Response, RegistryError> {
        #[cfg(test)]
        if self.panic_on == Some(command.name()) {
            panic!("{} exploded", command.name());
        }

        match command {
            Command::CreateTicket { session } => Ok(Response::Ticket(self.create_ticket(session))),
            Command::CreateConnection {
                user_sub,
                ticket,
                sender,
                ticket_ttl,
            } => self
                .create_connection(&user_sub, &ticket, sender, ticket_ttl)
                .map(|s| Response::Subscriber(Box::new(s))),
            Command::DeleteConnection {
                user_sub,
                connection_id,
            } => self
                .delete_connection(&user_sub, &connection_id)
                .map(|_| Response::Ack),
            Command::GetSubscriber { auth, ticket_ttl } => self
                .get_subscriber(&auth, ticket_ttl)
                .map(|s| Response::Subscriber(Box::new(s))),
            Command::SendMessage { targets, frame } => {
                self.send_message(&targets, frame).map(Response::Sent)
            }
            Command::AddSubscribedTopic {
                user_sub,
                topic,
                targets,
            } => self
                .add_subscribed_topic(&user_sub, &topic, &targets)
                .map(|_| Response::Ack),
            Command::GetSubscribedTargets { user_sub } => Ok(Response::Targets(
                self.subscribers
                    .get(&user_sub)
                    .map(|s| s.connection_ids.clone())
                    .unwrap_or_default(),
            )),
            Command::DeleteSubscribedTopic {
                user_sub,
                topic,
                connection_id,
            } => {
                self.delete_subscribed_topic(&user_sub, &topic, connection_id.as_deref());
                Ok(Response::Ack)
            }
            Command::HasSubscribedTopic {
                user_sub,
                topic,
                connection_id,
            } => Ok(Response::Bool(self.has_subscribed_topic(
                &user_sub,
                &topic,
                connection_id.as_deref(),
            ))),
            Command::GetTopicTargets { topic } => Ok(Response::Targets(self.topic_targets(&topic))),
            Command::GetGroupTargets { group_id } => {
                Ok(Response::Targets(self.group_targets(&group_id)))
            }
            Command::Stats => Ok(Response::Stats(self.stats())),
            Command::Sweep { ticket_ttl } => Ok(Response::Swept(self.sweep(ticket_ttl))),
        }
    }

    fn create_ticket(&mut self, session: SessionIdentity) -> Ticket {
        let ticket = Ticket::mint();
        let subscriber = self
            .subscribers
            .entry(session.sub.clone())
            .or_insert_with(|| Subscriber::new(session.clone()));
        // group or roles may have changed since the subscriber was created
        subscriber.session = session;
        subscriber.tickets.insert(
            ticket.auth.clone(),
            PendingTicket {
                connection_id: ticket.connection_id.clone(),
                issued_at: Instant::now(),
            },
        );
        ticket
    }

    fn create_connection(
        &mut self,
        user_sub: &str,
        ticket: &Ticket,
        sender: FrameSender,
        ticket_ttl: Duration,
    ) -> Result<Subscriber, RegistryError> {
        let subscriber = self
            .subscribers
            .get_mut(user_sub)
            .ok_or_else(|| RegistryError::InvalidTicket("no subscriber for ticket".into()))?;

        let pending = subscriber
            .tickets
            .remove(&ticket.auth)
            .ok_or_else(|| RegistryError::InvalidTicket("unknown or consumed".into()))?;

        if pending.connection_id != ticket.connection_id {
            return Err(RegistryError::InvalidTicket("connection id mismatch".into()));
        }
        if pending.issued_at.elapsed() > ticket_ttl {
            return Err(RegistryError::InvalidTicket("expired".into()));
        }

        subscriber.connection_ids.insert(ticket.connection_id.clone());
        let snapshot = subscriber.clone();

        self.connections.insert(
            ticket.connection_id.clone(),
            LocalConnection {
                user_sub: user_sub.to_string(),
                sender,
            },
        );
        Ok(snapshot)
    }

    fn delete_connection(
        &mut self,
        user_sub: &str,
        connection_id: &str,
    ) -> Result<(), RegistryError> {
        let removed = self.connections.remove(connection_id);

        let Some(subscriber) = self.subscribers.get_mut(user_sub) else {
            if removed.is_some() {
                return Err(RegistryError::Invariant(format!(
                    "connection {} recorded without subscriber {}",
                    connection_id, user_sub
                )));
            }
            return Ok(());
        };

        subscriber.splice_connection(connection_id);
        // the subscriber goes with its last connection, pending tickets included
        if subscriber.connection_ids.is_empty() {
            self.subscribers.remove(user_sub);
        }
        Ok(())
    }

    fn get_subscriber(
        &self,
        auth: &str,
        ticket_ttl: Duration,
    ) -> Result<Subscriber, RegistryError> {
        for subscriber in self.subscribers.values() {
            if let Some(pending) = subscriber.tickets.get(auth) {
                if pending.issued_at.elapsed() > ticket_ttl {
                    return Err(RegistryError::InvalidTicket("expired".into()));
                }
                return Ok(subscriber.clone());
            }
        }
        Err(RegistryError::SubscriberNotFound(auth.to_string()))
    }

    fn send_message(&self, targets: &Targets, frame: Frame) -> Result<SendReport, RegistryError> {
        if targets.is_empty() {
            return Err(RegistryError::NoTargets);
        }

        let mut report = SendReport {
            total: targets.len(),
            ..Default::default()
        };
        for target in targets.iter() {
            // remote-only ids are delivered by the broker
            let Some(conn) = self.connections.get(target) else {
                continue;
            };
            if !self.subscribers.contains_key(&conn.user_sub) {
                return Err(RegistryError::Invariant(format!(
                    "connection {} recorded without subscriber {}",
                    target, conn.user_sub
                )));
            }
            match conn.sender.send(frame.clone()) {
                Ok(()) => report.sent.push(target.to_string()),
                Err(_) => report.failed.push(target.to_string()),
            }
        }
        Ok(report)
    }

    fn add_subscribed_topic(
        &mut self,
        user_sub: &str,
        topic: &str,
        targets: &Targets,
    ) -> Result<(), RegistryError> {
        let subscriber = self
            .subscribers
            .get_mut(user_sub)
            .ok_or_else(|| RegistryError::SubscriberNotFound(user_sub.to_string()))?;

        let live = &subscriber.connection_ids;
        let accepted: Vec<&str> = targets.iter().filter(|t| live.contains(t)).collect();
        if accepted.is_empty() {
            return Ok(());
        }

        let entry = subscriber
            .subscribed_topics
            .entry(topic.to_string())
            .or_default();
        for id in accepted {
            entry.insert(id);
        }
        Ok(())
    }

    fn delete_subscribed_topic(
        &mut self,
        user_sub: &str,
        topic: &str,
        connection_id: Option<&str>,
    ) {
        let Some(subscriber) = self.subscribers.get_mut(user_sub) else {
            return;
        };
        match connection_id {
            Some(id) => {
                if let Some(targets) = subscriber.subscribed_topics.get_mut(topic) {
                    targets.remove(id);
                    if targets.is_empty() {
                        subscriber.subscribed_topics.shift_remove(topic);
                    }
                }
            }
            None => {
                subscriber.subscribed_topics.shift_remove(topic);
            }
        }
    }

    fn has_subscribed_topic(
        &self,
        user_sub: &str,
        topic: &str,
        connection_id: Option<&str>,
    ) -> bool {
        self.subscribers
            .get(user_sub)
            .and_then(|s| s.subscribed_topics.get(topic))
            .is_some_and(|targets| match connection_id {
                Some(id) => targets.contains(id),
                None => !targets.is_empty(),
            })
    }

    fn topic_targets(&self, topic: &str) -> Targets {
        let mut all = Targets::new();
        for subscriber in self.subscribers.values() {
            if let Some(targets) = subscriber.subscribed_topics.get(topic) {
                all.extend(targets);
            }
        }
        all
    }

    fn group_targets(&self, group_id: &str) -> Targets {
        let mut all = Targets::new();
        for subscriber in self.subscribers.values() {
            if subscriber.session.group_id == group_id {
                all.extend(&subscriber.connection_ids);
            }
        }
        all
    }

    fn stats(&self) -> RegistryStats {
        let mut topics: Vec<&str> = self
            .subscribers
            .values()
            .flat_map(|s| s.subscribed_topics.keys().map(String::as_str))
            .collect();
        topics.sort_unstable();
        topics.dedup();

        RegistryStats {
            subscribers: self.subscribers.len(),
            connections: self.connections.len(),
            pending_tickets: self.subscribers.values().map(|s| s.tickets.len()).sum(),
            topics: topics.len(),
        }
    }

    fn sweep(&mut self, ticket_ttl: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        for subscriber in self.subscribers.values_mut() {
            let before = subscriber.tickets.len();
            subscriber
                .tickets
                .retain(|_, pending| pending.issued_at.elapsed() <= ticket_ttl);
            report.expired_tickets += before - subscriber.tickets.len();
        }

        let before = self.subscribers.len();
        self.subscribers
            .retain(|_, s| !s.connection_ids.is_empty() || !s.tickets.is_empty());
        report.dropped_subscribers = before - self.subscribers.len();
        report
    }

    #[cfg(test)]
    pub(crate) fn forget_subscriber(&mut self, user_sub: &str) {
        self.subscribers.remove(user_sub);
    }

    #[cfg(test)]
    pub(crate) fn panic_on(&mut self, command: &'static str) {
        self.panic_on = Some(command);
    }

    /// Check the topic/connection invariant for every subscriber
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), RegistryError> {
        for subscriber in self.subscribers.values() {
            for (topic, targets) in &subscriber.subscribed_topics {
                let stray = targets
                    .iter()
                    .find(|t| !subscriber.connection_ids.contains(t));
                if let Some(stray) = stray {
                    return Err(RegistryError::Invariant(format!(
                        "{} on {} is not a live connection of {}",
                        stray,
                        topic,
                        subscriber.user_sub()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const TTL: Duration = Duration::from_secs(60);

    fn alice() -> SessionIdentity {
        SessionIdentity::new("alice", "g1", "role")
    }

    fn connect(
        state: &mut RegistryState,
        session: SessionIdentity,
    ) -> (Ticket, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ticket = state.create_ticket(session.clone());
        state.create_connection(&session.sub, &ticket, tx, TTL).unwrap();
        (ticket, rx)
    }

    #[tokio::test]
    async fn test_ticket_is_single_use() {
        let mut state = RegistryState::default();
        let ticket = state.create_ticket(alice());
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(state.create_connection("alice", &ticket, tx.clone(), TTL).is_ok());
        let err = state.create_connection("alice", &ticket, tx, TTL).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTicket(_)));
    }

    #[tokio::test]
    async fn test_unknown_ticket_rejected() {
        let mut state = RegistryState::default();
        state.create_ticket(alice());
        let (tx, _rx) = mpsc::unbounded_channel();

        let forged = Ticket::mint();
        assert!(state.create_connection("alice", &forged, tx, TTL).is_err());
        assert!(matches!(
            state.get_subscriber(&forged.auth, TTL),
            Err(RegistryError::SubscriberNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_ticket_rejected() {
        let mut state = RegistryState::default();
        let ticket = state.create_ticket(alice());
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(matches!(
            state.get_subscriber(&ticket.auth, TTL),
            Err(RegistryError::InvalidTicket(_))
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(state.create_connection("alice", &ticket, tx, TTL).is_err());
    }

    #[tokio::test]
    async fn test_delete_last_connection_drops_subscriber() {
        let mut state = RegistryState::default();
        let (ticket, _rx) = connect(&mut state, alice());

        state.delete_connection("alice", &ticket.connection_id).unwrap();

        assert_eq!(state.stats().subscribers, 0);
        assert_eq!(state.stats().connections, 0);
        assert!(state.get_subscriber(&ticket.auth, TTL).is_err());
    }

    #[tokio::test]
    async fn test_delete_last_connection_discards_pending_tickets() {
        let mut state = RegistryState::default();
        let (first, _rx) = connect(&mut state, alice());
        let second = state.create_ticket(alice());
        assert_eq!(state.stats().pending_tickets, 1);

        state.delete_connection("alice", &first.connection_id).unwrap();

        let stats = state.stats();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.pending_tickets, 0);
        assert!(matches!(
            state.get_subscriber(&second.auth, TTL),
            Err(RegistryError::SubscriberNotFound(_))
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(state.create_connection("alice", &second, tx, TTL).is_err());
    }

    #[tokio::test]
    async fn test_add_subscribed_topic_only_accepts_live_connections() {
        let mut state = RegistryState::default();
        let (ticket, _rx) = connect(&mut state, alice());
        let conn = ticket.connection_id.clone();

        let mut targets = Targets::single(conn.clone());
        targets.insert("ffffffff-ffff-ffff-ffff-ffffffffffff");
        state.add_subscribed_topic("alice", "exchange/0:X", &targets).unwrap();
        state.add_subscribed_topic("alice", "exchange/0:X", &targets).unwrap();

        assert!(state.has_subscribed_topic("alice", "exchange/0:X", Some(&conn)));
        assert!(!state.has_subscribed_topic(
            "alice",
            "exchange/0:X",
            Some("ffffffff-ffff-ffff-ffff-ffffffffffff")
        ));
        assert_eq!(state.topic_targets("exchange/0:X").len(), 1);
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_delete_connection_splices_topics() {
        let mut state = RegistryState::default();
        let (first, _rx1) = connect(&mut state, alice());
        let (second, _rx2) = connect(&mut state, alice());

        let both: Targets = [first.connection_id.clone(), second.connection_id.clone()]
            .into_iter()
            .collect();
        state.add_subscribed_topic("alice", "t", &both).unwrap();
        state.delete_connection("alice", &first.connection_id).unwrap();

        assert!(!state.has_subscribed_topic("alice", "t", Some(&first.connection_id)));
        assert!(state.has_subscribed_topic("alice", "t", None));
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_send_message_skips_remote_and_reports() {
        let mut state = RegistryState::default();
        let (ticket, mut rx) = connect(&mut state, alice());

        let mut targets = Targets::single(ticket.connection_id.clone());
        targets.insert("ffffffff-ffff-ffff-ffff-ffffffffffff");
        let report = state.send_message(&targets, Frame::from(&b"hi"[..])).unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.sent, vec![ticket.connection_id]);
        assert_eq!(&*rx.recv().await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_send_message_empty_targets() {
        let state = RegistryState::default();
        assert_eq!(
            state.send_message(&Targets::new(), Frame::from(&b"x"[..])),
            Err(RegistryError::NoTargets)
        );
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_failed() {
        let mut state = RegistryState::default();
        let (ticket, rx) = connect(&mut state, alice());
        drop(rx);

        let report = state
            .send_message(&Targets::single(ticket.connection_id.clone()), Frame::from(&b"x"[..]))
            .unwrap();
        assert_eq!(report.failed, vec![ticket.connection_id]);
    }

    #[tokio::test]
    async fn test_delete_subscribed_topic_narrowed() {
        let mut state = RegistryState::default();
        let (a, _rx1) = connect(&mut state, alice());
        let (b, _rx2) = connect(&mut state, alice());
        let both: Targets = [a.connection_id.clone(), b.connection_id.clone()]
            .into_iter()
            .collect();
        state.add_subscribed_topic("alice", "t", &both).unwrap();

        state.delete_subscribed_topic("alice", "t", Some(&a.connection_id));
        assert!(state.has_subscribed_topic("alice", "t", Some(&b.connection_id)));

        state.delete_subscribed_topic("alice", "t", None);
        assert!(!state.has_subscribed_topic("alice", "t", None));
    }

    #[tokio::test]
    async fn test_group_targets() {
        let mut state = RegistryState::default();
        let (a, _rx1) = connect(&mut state, alice());
        let (_b, _rx2) = connect(&mut state, SessionIdentity::new("bob", "g2", ""));

        let targets = state.group_targets("g1");
        assert_eq!(targets.iter().collect::<Vec<_>>(), vec![a.connection_id.as_str()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_stale_tickets_and_empty_subscribers() {
        let mut state = RegistryState::default();
        state.create_ticket(alice());
        let (_t, _rx) = connect(&mut state, SessionIdentity::new("bob", "g1", ""));

        tokio::time::advance(TTL * 2).await;
        let report = state.sweep(TTL);

        assert_eq!(report.expired_tickets, 1);
        assert_eq!(report.dropped_subscribers, 1);
        assert_eq!(state.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_connection_without_subscriber_is_invariant_violation() {
        let mut state = RegistryState::default();
        let (ticket, _rx) = connect(&mut state, alice());
        state.subscribers.clear();

        let err = state.delete_connection("alice", &ticket.connection_id).unwrap_err();
        assert!(err.is_fatal());
    }
}
