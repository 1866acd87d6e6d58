//! Topic names and socket ids
//!
//! Topics look like `exchange/<class>:<handle>`, for example
//! `exchange/2:0195ec07-e989-71ac-a0c4-f6a08d1f93f6`. A socket id joins a user
//! sub and a connection id as `<user-sub>:<connection-id>`.

use super::error::SockError;
use super::targets::CONNECTION_ID_LEN;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const EXCHANGE_PREFIX: &str = "exchange/";

/// Longest topic accepted from a client
pub const MAX_TOPIC_LEN: usize = 255;

/// The bookable exchange classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeClass {
    Text = 0,
    Call = 1,
    Whiteboard = 2,
}

impl ExchangeClass {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(ExchangeClass::Text),
            "1" => Some(ExchangeClass::Call),
            "2" => Some(ExchangeClass::Whiteboard),
            _ => None,
        }
    }
}

/// A topic split into its class and handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTopic<'a> {
    pub class: ExchangeClass,
    pub handle: &'a str,
}

impl<'a> ExchangeTopic<'a> {
    /// `None` for anything that is not `exchange/{0,1,2}:<handle>`
    pub fn parse(topic: &'a str) -> Option<Self> {
        let rest = topic.strip_prefix(EXCHANGE_PREFIX)?;
        let (class, handle) = rest.split_once(':')?;
        let class = ExchangeClass::from_code(class)?;
        if handle.is_empty() {
            return None;
        }
        Some(Self { class, handle })
    }

    /// The handle as a booking id, if it is a UUID
    pub fn booking_id(&self) -> Option<Uuid> {
        Uuid::parse_str(self.handle).ok()
    }
}

/// Basic shape check applied to every topic a client names
pub fn validate_topic(topic: &str) -> Result<(), SockError> {
    if topic.is_empty() {
        return Err(SockError::Input("empty topic".into()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(SockError::Input(format!(
            "topic is {} bytes, limit is {}",
            topic.len(),
            MAX_TOPIC_LEN
        )));
    }
    if topic.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SockError::Input(format!("topic {:?} has whitespace", topic)));
    }
    Ok(())
}

/// `<user-sub>:<connection-id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketId {
    pub user_sub: String,
    pub connection_id: String,
}

impl SocketId {
    pub fn new(user_sub: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            user_sub: user_sub.into(),
            connection_id: connection_id.into(),
        }
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_sub, self.connection_id)
    }
}

impl FromStr for SocketId {
    type Err = SockError;

    /// The connection id is always the last 36 bytes, so user subs may contain `:`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || SockError::Input(format!("malformed socket id {:?}", raw));
        if raw.len() < CONNECTION_ID_LEN + 2 {
            return Err(malformed());
        }
        let split = raw.len() - CONNECTION_ID_LEN;
        if !raw.is_char_boundary(split) || raw.as_bytes()[split - 1] != b':' {
            return Err(malformed());
        }
        Ok(Self {
            user_sub: raw[..split - 1].to_string(),
            connection_id: raw[split..].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str = "0195ec07-e989-71ac-a0c4-f6a08d1f93f6";

    #[test]
    fn test_parse_exchange_topic() {
        let raw = format!("exchange/2:{}", CONN);
        let topic = ExchangeTopic::parse(&raw).unwrap();
        assert_eq!(topic.class, ExchangeClass::Whiteboard);
        assert_eq!(topic.handle, CONN);
        assert!(topic.booking_id().is_some());
    }

    #[test]
    fn test_non_exchange_topics() {
        assert!(ExchangeTopic::parse("exchange/9:abc").is_none());
        assert!(ExchangeTopic::parse("exchange/0:").is_none());
        assert!(ExchangeTopic::parse("lobby/0:abc").is_none());
        assert!(ExchangeTopic::parse("exchange/0").is_none());
        assert!(ExchangeTopic::parse("exchange/0:not-a-uuid").unwrap().booking_id().is_none());
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("exchange/0:X").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("exchange/0: X").is_err());
        assert!(validate_topic(&"x".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[test]
    fn test_socket_id_roundtrip() {
        let sid = SocketId::new("alice", CONN);
        let raw = sid.to_string();
        assert_eq!(raw, format!("alice:{}", CONN));
        assert_eq!(raw.parse::<SocketId>().unwrap(), sid);
    }

    #[test]
    fn test_socket_id_with_colon_in_sub() {
        let raw = format!("realm:bob:{}", CONN);
        let sid: SocketId = raw.parse().unwrap();
        assert_eq!(sid.user_sub, "realm:bob");
        assert_eq!(sid.connection_id, CONN);
    }

    #[test]
    fn test_malformed_socket_id() {
        assert!("short".parse::<SocketId>().is_err());
        assert!(format!("alice-{}", CONN).parse::<SocketId>().is_err());
        assert!(format!(":{}", CONN).parse::<SocketId>().is_err());
    }
}
