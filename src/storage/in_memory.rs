//! In-memory message store for testing and development
//!
//! Keeps the same tables the SQL backend uses. Bookings and user profiles are
//! owned by other services in production, so tests seed them with
//! [`InMemoryStore::grant_booking`] and [`InMemoryStore::add_profile`].

use super::{MessageStore, finish_page, validate_page};
use crate::core::{Participants, SessionIdentity, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ConnectionRow {
    created_sub: String,
}

#[derive(Debug, Clone)]
struct MessageRow {
    seq: u64,
    created_sub: String,
    connection_id: String,
    topic: String,
    message: Vec<u8>,
    created_on: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct BookingRow {
    slot_owner: String,
    quote_owner: String,
}

#[derive(Debug, Clone)]
struct ProfileRow {
    initials: String,
    role: String,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<String, ConnectionRow>,
    messages: Vec<MessageRow>,
    bookings: HashMap<Uuid, BookingRow>,
    profiles: HashMap<String, ProfileRow>,
    next_seq: u64,
}

/// Message store held in process memory
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `slot_owner` and `quote_owner` the two users allowed on a booking
    pub fn grant_booking(&self, booking_id: Uuid, slot_owner: &str, quote_owner: &str) {
        if let Ok(mut tables) = self.tables.write() {
            tables.bookings.insert(
                booking_id,
                BookingRow {
                    slot_owner: slot_owner.to_string(),
                    quote_owner: quote_owner.to_string(),
                },
            );
        }
    }

    pub fn add_profile(&self, sub: &str, first_name: &str, last_name: &str, role: &str) {
        let initials: String = first_name
            .chars()
            .take(1)
            .chain(last_name.chars().take(1))
            .collect();
        if let Ok(mut tables) = self.tables.write() {
            tables.profiles.insert(
                sub.to_string(),
                ProfileRow {
                    initials,
                    role: role.to_string(),
                },
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.tables.read().map(|t| t.connections.len()).unwrap_or(0)
    }

    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.tables
            .read()
            .map(|t| t.connections.contains_key(connection_id))
            .unwrap_or(false)
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.tables
            .read()
            .map(|t| t.messages.iter().filter(|m| m.topic == topic).count())
            .unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|e| StoreError::Database(format!("Failed to acquire read lock: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|e| StoreError::Database(format!("Failed to acquire write lock: {}", e)))
    }
}

fn has_messages(tables: &Tables, connection_id: &str) -> bool {
    tables
        .messages
        .iter()
        .any(|m| m.connection_id == connection_id)
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn init_connection(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.connections.insert(
            connection_id.to_string(),
            ConnectionRow {
                created_sub: session.sub.clone(),
            },
        );
        Ok(())
    }

    async fn remove_connection(
        &self,
        _session: &SessionIdentity,
        connection_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        if has_messages(&tables, connection_id) {
            return Ok(false);
        }
        Ok(tables.connections.remove(connection_id).is_some())
    }

    async fn cleanup_orphans(&self) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let orphans: Vec<String> = tables
            .connections
            .keys()
            .filter(|id| !has_messages(&tables, id))
            .cloned()
            .collect();
        for id in &orphans {
            tables.connections.remove(id);
        }
        Ok(orphans.len() as u64)
    }

    async fn append(
        &self,
        _session: &SessionIdentity,
        connection_id: &str,
        topic: &str,
        frame: &[u8],
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let created_sub = tables
            .connections
            .get(connection_id)
            .map(|row| row.created_sub.clone())
            .ok_or_else(|| StoreError::ConnectionNotFound(connection_id.to_string()))?;

        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables.messages.push(MessageRow {
            seq,
            created_sub,
            connection_id: connection_id.to_string(),
            topic: topic.to_string(),
            message: frame.to_vec(),
            created_on: Utc::now(),
        });
        Ok(())
    }

    async fn load_page(
        &self,
        _session: &SessionIdentity,
        topic: &str,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let offset = validate_page(page, page_size)?;
        let tables = self.read()?;

        let mut rows: Vec<&MessageRow> = tables
            .messages
            .iter()
            .filter(|m| m.topic == topic)
            .collect();
        rows.sort_by(|a, b| b.created_on.cmp(&a.created_on).then(b.seq.cmp(&a.seq)));

        let frames = rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(page_size).unwrap_or(usize::MAX))
            .map(|m| m.message.clone())
            .collect();

        finish_page(topic, frames, page_size)
    }

    async fn allowed(
        &self,
        session: &SessionIdentity,
        booking_id: Uuid,
    ) -> Result<bool, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .bookings
            .get(&booking_id)
            .is_some_and(|b| b.slot_owner == session.sub || b.quote_owner == session.sub))
    }

    async fn participants(
        &self,
        _session: &SessionIdentity,
        topic: &str,
        acc: &mut Participants,
    ) -> Result<(), StoreError> {
        let tables = self.read()?;
        let mut stored = Participants::new();
        for m in tables.messages.iter().filter(|m| m.topic == topic) {
            stored.add(&m.created_sub, &m.connection_id, false);
        }
        acc.merge(stored);
        Ok(())
    }

    async fn enrich_participants(
        &self,
        _session: &SessionIdentity,
        acc: &mut Participants,
    ) -> Result<(), StoreError> {
        let tables = self.read()?;
        let subs: Vec<String> = acc.subs().map(str::to_string).collect();
        for sub in subs {
            if let (Some(profile), Some(participant)) =
                (tables.profiles.get(&sub), acc.get_mut(&sub))
            {
                participant.name = profile.initials.clone();
                participant.role = profile.role.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SocketAction, SocketMessage};

    const TOPIC: &str = "exchange/0:X";

    fn alice() -> SessionIdentity {
        SessionIdentity::new("alice", "g1", "")
    }

    fn text(n: usize) -> Vec<u8> {
        SocketMessage::new(SocketAction::Text, TOPIC)
            .with_sender("alice", "c1")
            .with_payload(format!("m{n}").into_bytes())
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_requires_connection_row() {
        let store = InMemoryStore::new();
        let err = store.append(&alice(), "c1", TOPIC, &text(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::ConnectionNotFound(_)));

        store.init_connection(&alice(), "c1").await.unwrap();
        store.append(&alice(), "c1", TOPIC, &text(0)).await.unwrap();
        assert_eq!(store.message_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_pages_newest_first_with_sentinel() {
        let store = InMemoryStore::new();
        store.init_connection(&alice(), "c1").await.unwrap();
        for n in 0..10 {
            store.append(&alice(), "c1", TOPIC, &text(n)).await.unwrap();
        }

        let page = store.load_page(&alice(), TOPIC, 1, 10).await.unwrap();
        assert_eq!(page.len(), 11);
        assert_eq!(SocketMessage::decode(&page[0]).unwrap().payload, b"m9");
        assert_eq!(SocketMessage::decode(&page[9]).unwrap().payload, b"m0");
        assert_eq!(
            SocketMessage::decode(&page[10]).unwrap().action,
            SocketAction::HasMoreMessages
        );

        assert!(store.load_page(&alice(), TOPIC, 2, 10).await.unwrap().is_empty());

        let partial = store.load_page(&alice(), TOPIC, 2, 6).await.unwrap();
        assert_eq!(partial.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_page() {
        let store = InMemoryStore::new();
        let err = store.load_page(&alice(), TOPIC, 0, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPage { page: 0, .. }));

        let err = store.load_page(&alice(), TOPIC, i64::MAX, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPage { page: i64::MAX, .. }));
    }

    #[tokio::test]
    async fn test_remove_keeps_rows_with_messages() {
        let store = InMemoryStore::new();
        store.init_connection(&alice(), "c1").await.unwrap();
        store.init_connection(&alice(), "c2").await.unwrap();
        store.init_connection(&alice(), "c3").await.unwrap();
        store.append(&alice(), "c1", TOPIC, &text(0)).await.unwrap();

        assert!(!store.remove_connection(&alice(), "c1").await.unwrap());
        assert!(store.remove_connection(&alice(), "c2").await.unwrap());
        assert!(store.has_connection("c1"));

        assert_eq!(store.cleanup_orphans().await.unwrap(), 1);
        assert!(store.has_connection("c1"));
        assert!(!store.has_connection("c3"));
    }

    #[tokio::test]
    async fn test_allowed_slot_or_quote_owner() {
        let store = InMemoryStore::new();
        let booking = Uuid::new_v4();
        store.grant_booking(booking, "alice", "bob");

        assert!(store.allowed(&alice(), booking).await.unwrap());
        assert!(store.allowed(&SessionIdentity::new("bob", "g1", ""), booking).await.unwrap());
        assert!(!store.allowed(&SessionIdentity::new("carol", "g1", ""), booking).await.unwrap());
        assert!(!store.allowed(&alice(), Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_participants_and_enrichment() {
        let store = InMemoryStore::new();
        store.init_connection(&alice(), "c1").await.unwrap();
        store.append(&alice(), "c1", TOPIC, &text(0)).await.unwrap();
        store.add_profile("alice", "Alice", "Liddell", "Admin");

        let mut acc = Participants::new();
        acc.add("bob", "c7", true);
        store.participants(&alice(), TOPIC, &mut acc).await.unwrap();
        store.enrich_participants(&alice(), &mut acc).await.unwrap();

        let a = acc.get("alice").unwrap();
        assert_eq!(a.cids, vec!["c1"]);
        assert!(!a.online);
        assert_eq!(a.name, "AL");
        assert_eq!(a.role, "Admin");
        assert!(acc.get("bob").unwrap().online);
        assert_eq!(acc.get("bob").unwrap().name, "");
    }
}
