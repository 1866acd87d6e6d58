//! Participant records sent to clients in LOAD_SUBSCRIBERS payloads

use super::topic::SocketId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One user present on a topic
///
/// `scid` is the user sub and `cids` the connection ids known for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub scid: String,
    pub cids: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub online: bool,
}

impl Participant {
    pub fn new(user_sub: impl Into<String>) -> Self {
        Self {
            scid: user_sub.into(),
            ..Default::default()
        }
    }

    pub fn online(mut self) -> Self {
        self.online = true;
        self
    }

    pub fn add_connection(&mut self, connection_id: &str) {
        if !self.cids.iter().any(|c| c == connection_id) {
            self.cids.push(connection_id.to_string());
        }
    }
}

/// Participants keyed by user sub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Participants(IndexMap<String, Participant>);

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group socket ids by user; everything found this way is online
    pub fn from_socket_ids<'a>(socket_ids: impl IntoIterator<Item = &'a SocketId>) -> Self {
        let mut participants = Self::new();
        for sid in socket_ids {
            participants.add(&sid.user_sub, &sid.connection_id, true);
        }
        participants
    }

    pub fn add(&mut self, user_sub: &str, connection_id: &str, online: bool) {
        let entry = self
            .0
            .entry(user_sub.to_string())
            .or_insert_with(|| Participant::new(user_sub));
        entry.add_connection(connection_id);
        entry.online |= online;
    }

    /// Union connection ids per user; online wins over offline
    pub fn merge(&mut self, other: Participants) {
        for (sub, incoming) in other.0 {
            match self.0.get_mut(&sub) {
                Some(existing) => {
                    for cid in &incoming.cids {
                        existing.add_connection(cid);
                    }
                    existing.online |= incoming.online;
                    if existing.name.is_empty() {
                        existing.name = incoming.name;
                    }
                    if existing.role.is_empty() {
                        existing.role = incoming.role;
                    }
                }
                None => {
                    self.0.insert(sub, incoming);
                }
            }
        }
    }

    pub fn get(&self, user_sub: &str) -> Option<&Participant> {
        self.0.get(user_sub)
    }

    pub fn get_mut(&mut self, user_sub: &str) -> Option<&mut Participant> {
        self.0.get_mut(user_sub)
    }

    pub fn subs(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.0.values()
    }

    pub fn online_subs(&self) -> Vec<&str> {
        self.0
            .values()
            .filter(|p| p.online)
            .map(|p| p.scid.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_user() {
        let sids = [
            SocketId::new("alice", "c1"),
            SocketId::new("alice", "c2"),
            SocketId::new("bob", "c3"),
        ];
        let participants = Participants::from_socket_ids(&sids);
        assert_eq!(participants.len(), 2);
        assert_eq!(participants.get("alice").unwrap().cids, vec!["c1", "c2"]);
        assert!(participants.get("bob").unwrap().online);
    }

    #[test]
    fn test_merge_keeps_online_and_dedupes() {
        let mut cached = Participants::new();
        cached.add("alice", "c1", true);

        let mut stored = Participants::new();
        stored.add("alice", "c1", false);
        stored.add("alice", "c0", false);
        stored.add("carol", "c9", false);

        cached.merge(stored);
        let alice = cached.get("alice").unwrap();
        assert_eq!(alice.cids, vec!["c1", "c0"]);
        assert!(alice.online);
        assert!(!cached.get("carol").unwrap().online);
        assert_eq!(cached.online_subs(), vec!["alice"]);
    }

    #[test]
    fn test_json_shape() {
        let mut participants = Participants::new();
        participants.add("alice", "c1", true);
        let json = serde_json::to_value(&participants).unwrap();
        assert_eq!(json["alice"]["scid"], "alice");
        assert_eq!(json["alice"]["cids"][0], "c1");
        assert_eq!(json["alice"]["online"], true);
    }
}
