//! Session identity and handshake tickets
//!
//! The auth proxy in front of the service authenticates users; this module only
//! consumes the identity it forwards. A [`SessionIdentity`] keys registry
//! subscribers and is the envelope published to the database before every
//! user-scoped query.

use super::error::SockError;
use async_trait::async_trait;
use axum::http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

pub const USER_SUB_HEADER: &str = "x-user-sub";
pub const GROUP_ID_HEADER: &str = "x-group-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";

static TICKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    let uuid = "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";
    Regex::new(&format!("^({uuid}):({uuid})$")).expect("ticket pattern is valid")
});

/// Who a connection belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub sub: String,
    pub group_id: String,
    /// Space-joined role names
    pub roles: String,
}

impl SessionIdentity {
    pub fn new(
        sub: impl Into<String>,
        group_id: impl Into<String>,
        roles: impl Into<String>,
    ) -> Self {
        Self {
            sub: sub.into(),
            group_id: group_id.into(),
            roles: roles.into(),
        }
    }

    /// The system identity used for maintenance queries
    pub fn worker() -> Self {
        Self::new("worker", "", "")
    }

    #[cfg(test)]
    pub(crate) fn has_role(&self, role: &str) -> bool {
        self.roles.split_whitespace().any(|r| r == role)
    }
}

/// One-time handshake token `<auth-nonce>:<connection-id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub auth: String,
    pub connection_id: String,
}

impl Ticket {
    pub fn mint() -> Self {
        Self {
            auth: Uuid::new_v4().to_string(),
            connection_id: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.auth, self.connection_id)
    }
}

impl FromStr for Ticket {
    type Err = SockError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let caps = TICKET_RE
            .captures(raw)
            .ok_or_else(|| SockError::Input("malformed ticket".into()))?;
        Ok(Self {
            auth: caps[1].to_string(),
            connection_id: caps[2].to_string(),
        })
    }
}

/// Resolves the caller's session on the ticket endpoint
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self, headers: &HeaderMap) -> Result<SessionIdentity, SockError>;
}

/// Reads the identity headers set by the auth proxy
#[derive(Debug, Clone, Default)]
pub struct HeaderSessionProvider;

#[async_trait]
impl SessionProvider for HeaderSessionProvider {
    async fn session(&self, headers: &HeaderMap) -> Result<SessionIdentity, SockError> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };

        let sub = read(USER_SUB_HEADER);
        if sub.is_empty() {
            return Err(SockError::Auth("missing session".into()));
        }

        Ok(SessionIdentity {
            sub,
            group_id: read(GROUP_ID_HEADER),
            roles: read(USER_ROLES_HEADER),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_ticket_roundtrip() {
        let ticket = Ticket::mint();
        let raw = ticket.to_string();
        assert_eq!(raw.len(), 73);
        assert_eq!(raw.parse::<Ticket>().unwrap(), ticket);
    }

    #[test]
    fn test_malformed_tickets() {
        for raw in [
            "",
            "abc",
            "0195ec07-e989-71ac-a0c4-f6a08d1f93f6",
            "0195ec07-e989-71ac-a0c4-f6a08d1f93f6:",
            "0195ec07-e989-71ac-a0c4-f6a08d1f93f6:not-a-uuid",
            "0195ec07-e989-71ac-a0c4-f6a08d1f93f6:0195ec07-e989-71ac-a0c4-f6a08d1f93f6:x",
        ] {
            assert!(raw.parse::<Ticket>().is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_roles() {
        let session = SessionIdentity::new("alice", "g1", "APP_GROUP_SCHEDULES APP_GROUP_USERS");
        assert!(session.has_role("APP_GROUP_USERS"));
        assert!(!session.has_role("APP_GROUP"));
        assert_eq!(SessionIdentity::worker().sub, "worker");
    }

    #[tokio::test]
    async fn test_header_provider() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_SUB_HEADER, HeaderValue::from_static("alice"));
        headers.insert(GROUP_ID_HEADER, HeaderValue::from_static("g1"));
        headers.insert(USER_ROLES_HEADER, HeaderValue::from_static("a b"));

        let session = HeaderSessionProvider.session(&headers).await.unwrap();
        assert_eq!(session, SessionIdentity::new("alice", "g1", "a b"));

        let err = HeaderSessionProvider
            .session(&HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
