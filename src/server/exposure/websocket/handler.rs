//! WebSocket upgrade handler
//!
//! The ticket is checked before the upgrade so that malformed tickets get a
//! 400 and unknown or consumed tickets a 401 instead of a socket. Consuming the
//! ticket happens after the upgrade, inside the registry, so two racing
//! upgrades with the same ticket cannot both open.

use super::connection;
use crate::core::{RegistryError, SessionIdentity, SockError, Ticket};
use crate::server::host::SockHost;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct TicketQuery {
    pub ticket: Option<String>,
}

/// GET /sock?ticket=<auth>:<connection-id>
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TicketQuery>,
    State(host): State<Arc<SockHost>>,
) -> Response {
    match check_ticket(&host, query.ticket.as_deref()).await {
        Ok((session, ticket)) => ws
            .on_upgrade(move |socket| connection::serve(socket, host, session, ticket))
            .into_response(),
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake refused");
            e.into_response()
        }
    }
}

async fn check_ticket(
    host: &SockHost,
    raw: Option<&str>,
) -> Result<(SessionIdentity, Ticket), SockError> {
    let raw = raw
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SockError::Input("missing ticket".into()))?;
    let ticket: Ticket = raw.parse()?;

    let subscriber = host
        .registry
        .get_subscriber(&ticket.auth)
        .await
        .map_err(|e| match e {
            RegistryError::SubscriberNotFound(_) => {
                SockError::Auth("unknown or consumed ticket".into())
            }
            other => other.into(),
        })?;

    Ok((subscriber.session, ticket))
}
