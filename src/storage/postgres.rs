//! PostgreSQL message store using sqlx.
//!
//! Every call opens a transaction, publishes the session with
//! `dbfunc_schema.set_session_vars`, runs its statements, clears the session
//! with empty strings and commits. On any error the transaction is dropped,
//! which rolls back the session variables along with everything else.
//!
//! # Feature flag
//!
//! This module is gated behind the `postgres` feature flag.

use super::{MessageStore, finish_page, validate_page};
use crate::core::{Participants, SessionIdentity, StoreError};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const SET_SESSION_VARS: &str =
    "SELECT dbfunc_schema.set_session_vars($1::VARCHAR, $2::VARCHAR, $3::VARCHAR)";
const SET_SOCK_TOPIC: &str = "SELECT set_config('app_session.sock_topic', $1, true)";

/// Embedded migrations for the tables this store owns
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(
        &self,
        session: &SessionIdentity,
    ) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(SET_SESSION_VARS)
            .bind(&session.sub)
            .bind(&session.group_id)
            .bind(&session.roles)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn begin_topic(
        &self,
        session: &SessionIdentity,
        topic: &str,
    ) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.begin(session).await?;
        sqlx::query(SET_SOCK_TOPIC)
            .bind(topic)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn finish(mut tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
        sqlx::query(SET_SESSION_VARS)
            .bind("")
            .bind("")
            .bind("")
            .execute(&mut *tx)
            .await?;
        sqlx::query(SET_SOCK_TOPIC).bind("").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn init_connection(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin(session).await?;
        sqlx::query(
            "INSERT INTO dbtable_schema.sock_connections (created_sub, connection_id) \
             VALUES ($1::uuid, $2)",
        )
        .bind(&session.sub)
        .bind(connection_id)
        .execute(&mut *tx)
        .await?;
        Self::finish(tx).await
    }

    async fn remove_connection(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin(session).await?;
        let result = sqlx::query(
            "DELETE FROM dbtable_schema.sock_connections sc \
             WHERE sc.connection_id = $1 \
             AND NOT EXISTS ( \
               SELECT 1 FROM dbtable_schema.topic_messages tm \
               WHERE tm.connection_id = sc.connection_id \
             )",
        )
        .bind(connection_id)
        .execute(&mut *tx)
        .await?;
        Self::finish(tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_orphans(&self) -> Result<u64, StoreError> {
        let mut tx = self.begin(&SessionIdentity::worker()).await?;
        let result = sqlx::query(
            "DELETE FROM dbtable_schema.sock_connections sc \
             WHERE NOT EXISTS ( \
               SELECT 1 FROM dbtable_schema.topic_messages tm \
               WHERE tm.connection_id = sc.connection_id \
             )",
        )
        .execute(&mut *tx)
        .await?;
        Self::finish(tx).await?;
        Ok(result.rows_affected())
    }

    async fn append(
        &self,
        session: &SessionIdentity,
        connection_id: &str,
        topic: &str,
        frame: &[u8],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_topic(session, topic).await?;
        let result = sqlx::query(
            "INSERT INTO dbtable_schema.topic_messages \
               (created_sub, connection_id, topic, message) \
             SELECT sc.created_sub, sc.connection_id, $2, $3 \
             FROM dbtable_schema.sock_connections sc \
             WHERE sc.connection_id = $1 \
             LIMIT 1",
        )
        .bind(connection_id)
        .bind(topic)
        .bind(frame)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConnectionNotFound(connection_id.to_string()));
        }
        Self::finish(tx).await
    }

    async fn load_page(
        &self,
        session: &SessionIdentity,
        topic: &str,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let offset = validate_page(page, page_size)?;

        let mut tx = self.begin_topic(session, topic).await?;
        let frames: Vec<Vec<u8>> = sqlx::query_scalar(
            "SELECT message FROM dbtable_schema.topic_messages \
             WHERE topic = $1 \
             ORDER BY created_on DESC, id DESC \
             LIMIT $2 OFFSET $3",
        )
        .bind(topic)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&mut *tx)
        .await?;
        Self::finish(tx).await?;

        finish_page(topic, frames, page_size)
    }

    async fn allowed(
        &self,
        session: &SessionIdentity,
        booking_id: Uuid,
    ) -> Result<bool, StoreError> {
        // created_sub columns are uuids; any other sub can never match
        let Ok(user_sub) = Uuid::parse_str(&session.sub) else {
            return Ok(false);
        };

        let mut tx = self.begin(session).await?;
        let allowed: bool = sqlx::query_scalar(
            "SELECT EXISTS ( \
               SELECT 1 \
               FROM dbtable_schema.bookings b \
               JOIN dbtable_schema.schedule_bracket_slots sbs \
                 ON sbs.id = b.schedule_bracket_slot_id \
               JOIN dbtable_schema.quotes q ON q.id = b.quote_id \
               WHERE b.id = $2 AND (sbs.created_sub = $1 OR q.created_sub = $1) \
             )",
        )
        .bind(user_sub)
        .bind(booking_id)
        .fetch_one(&mut *tx)
        .await?;
        Self::finish(tx).await?;
        Ok(allowed)
    }

    async fn participants(
        &self,
        session: &SessionIdentity,
        topic: &str,
        acc: &mut Participants,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_topic(session, topic).await?;
        let rows: Vec<(String, Vec<String>)> = sqlx::query_as(
            "SELECT created_sub::text, ARRAY_AGG(DISTINCT connection_id) \
             FROM dbtable_schema.topic_messages \
             WHERE topic = $1 \
             GROUP BY created_sub",
        )
        .bind(topic)
        .fetch_all(&mut *tx)
        .await?;
        Self::finish(tx).await?;

        let mut stored = Participants::new();
        for (sub, cids) in rows {
            for cid in cids {
                stored.add(&sub, &cid, false);
            }
        }
        acc.merge(stored);
        Ok(())
    }

    async fn enrich_participants(
        &self,
        session: &SessionIdentity,
        acc: &mut Participants,
    ) -> Result<(), StoreError> {
        if acc.is_empty() {
            return Ok(());
        }
        let subs: Vec<String> = acc.subs().map(str::to_string).collect();

        let mut tx = self.begin(session).await?;
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT u.sub::text, LEFT(u.first_name, 1) || LEFT(u.last_name, 1), r.name \
             FROM dbtable_schema.users u \
             JOIN dbtable_schema.group_users gu ON gu.user_id = u.id \
             JOIN dbtable_schema.group_roles gr ON gr.external_id = gu.external_id \
             JOIN dbtable_schema.roles r ON r.id = gr.role_id \
             WHERE u.sub::text = ANY($1)",
        )
        .bind(&subs)
        .fetch_all(&mut *tx)
        .await?;
        Self::finish(tx).await?;

        for (sub, name, role) in rows {
            if let Some(participant) = acc.get_mut(&sub) {
                participant.name = name;
                participant.role = role;
            }
        }
        Ok(())
    }
}
