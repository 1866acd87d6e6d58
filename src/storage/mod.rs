//! Durable topic log and authorization queries
//!
//! Every operation runs on behalf of a [`SessionIdentity`]. SQL backends publish
//! that identity to the database before the query and clear it afterwards, so
//! row-level security always sees the right user. Topic-scoped operations also
//! publish the topic.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::core::{Participants, SessionIdentity, SocketAction, SocketMessage, StoreError};
use async_trait::async_trait;
use uuid::Uuid;

/// Check a page request and return its row offset; pages start at 1
pub fn validate_page(page: i64, page_size: i64) -> Result<i64, StoreError> {
    if page < 1 || page_size < 1 {
        return Err(StoreError::InvalidPage { page, page_size });
    }
    (page - 1)
        .checked_mul(page_size)
        .ok_or(StoreError::InvalidPage { page, page_size })
}

/// Append the HAS_MORE_MESSAGES sentinel when a page came back full
pub fn finish_page(
    topic: &str,
    mut frames: Vec<Vec<u8>>,
    page_size: i64,
) -> Result<Vec<Vec<u8>>, StoreError> {
    if frames.len() as i64 >= page_size {
        let sentinel = SocketMessage::new(SocketAction::HasMoreMessages, topic).encode()?;
        frames.push(sentinel);
    }
    Ok(frames)
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record a live connection
    async fn init_connection(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
    ) -> Result<(), StoreError>;

    /// Drop the connection row unless stored messages reference it
    ///
    /// Returns whether a row was deleted.
    async fn remove_connection(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
    ) -> Result<bool, StoreError>;

    /// Drop every connection row without stored messages; run at startup
    async fn cleanup_orphans(&self) -> Result<u64, StoreError>;

    /// Persist an encoded frame for `topic`
    ///
    /// The author is resolved from the connection row, so an unknown
    /// connection fails with [`StoreError::ConnectionNotFound`].
    async fn append(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
        topic: &str,
        frame: &[u8],
    ) -> Result<(), StoreError>;

    /// Newest first; a full page ends with a HAS_MORE_MESSAGES frame
    async fn load_page(
        &self,
        session: &SessionIdentity,
        topic: &str,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Whether the session user owns the booking's slot or quote
    async fn allowed(&self, session: &SessionIdentity, booking_id: Uuid)
    -> Result<bool, StoreError>;

    /// Merge users who have stored messages on `topic` into `acc`, offline
    async fn participants(
        &self,
        session: &SessionIdentity,
        topic: &str,
        acc: &mut Participants,
    ) -> Result<(), StoreError>;

    /// Fill in initials and role name for every user in `acc`
    async fn enrich_participants(
        &self,
        session: &SessionIdentity,
        acc: &mut Participants,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_page() {
        assert_eq!(validate_page(1, 10).unwrap(), 0);
        assert_eq!(validate_page(3, 20).unwrap(), 40);
        assert!(validate_page(0, 10).is_err());
        assert!(validate_page(1, 0).is_err());
        assert!(validate_page(-3, 10).is_err());
    }

    #[test]
    fn test_validate_page_rejects_overflowing_offset() {
        let err = validate_page(i64::MAX, 10).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPage { page: i64::MAX, page_size: 10 }));
        assert!(validate_page(2, i64::MAX).is_ok());
        assert!(validate_page(3, i64::MAX).is_err());
    }

    #[test]
    fn test_sentinel_only_on_full_page() {
        let frames = vec![b"a".to_vec(), b"b".to_vec()];
        assert_eq!(finish_page("t", frames.clone(), 3).unwrap().len(), 2);

        let full = finish_page("t", frames, 2).unwrap();
        assert_eq!(full.len(), 3);
        let sentinel = SocketMessage::decode(&full[2]).unwrap();
        assert_eq!(sentinel.action, SocketAction::HasMoreMessages);
        assert_eq!(sentinel.topic, "t");
    }
}
