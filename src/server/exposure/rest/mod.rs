//! REST exposure: health checks and ticket issuance
//!
//! The ticket endpoint sits behind the auth proxy; the host's
//! [`SessionProvider`](crate::core::SessionProvider) turns the proxied request
//! into a session identity.

use crate::core::SockError;
use crate::server::host::SockHost;
use anyhow::Result;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

pub const TICKET_PATH: &str = "/api/v1/sock/ticket";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketResponse {
    pub ticket: String,
}

pub struct RestExposure;

impl RestExposure {
    /// Build the REST router, merging any custom routes
    pub fn build_router(host: Arc<SockHost>, custom_routes: Vec<Router>) -> Result<Router> {
        let ticket_routes = Router::new()
            .route(TICKET_PATH, get(Self::issue_ticket))
            .with_state(host);

        let mut app = Self::health_routes().merge(ticket_routes);
        for custom_router in custom_routes {
            app = app.merge(custom_router);
        }
        Ok(app)
    }

    fn health_routes() -> Router {
        Router::new()
            .route("/health", get(Self::health_check))
            .route("/healthz", get(Self::health_check))
    }

    async fn health_check() -> Json<Value> {
        Json(json!({
            "status": "ok",
            "service": "topic-exchange"
        }))
    }

    async fn issue_ticket(
        State(host): State<Arc<SockHost>>,
        headers: HeaderMap,
    ) -> Result<Json<TicketResponse>, SockError> {
        let session = host.sessions.session(&headers).await?;
        let ticket = host.issue_ticket(&session).await?;
        Ok(Json(TicketResponse {
            ticket: ticket.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{GROUP_ID_HEADER, USER_SUB_HEADER};
    use crate::server::ServerBuilder;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;

    async fn server() -> TestServer {
        let host = ServerBuilder::new().build_host().await.unwrap();
        let app = RestExposure::build_router(host, vec![]).unwrap();
        TestServer::new(app)
    }

    #[tokio::test]
    async fn test_health() {
        let server = server().await;
        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_json(&json!({"status": "ok", "service": "topic-exchange"}));
    }

    #[tokio::test]
    async fn test_ticket_requires_session() {
        let server = server().await;
        let response = server.get(TICKET_PATH).await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["code"], "AUTH_ERROR");
    }

    #[tokio::test]
    async fn test_ticket_for_session() {
        let server = server().await;
        let response = server
            .get(TICKET_PATH)
            .add_header(
                HeaderName::from_static(USER_SUB_HEADER),
                HeaderValue::from_static("alice"),
            )
            .add_header(
                HeaderName::from_static(GROUP_ID_HEADER),
                HeaderValue::from_static("g1"),
            )
            .await;
        response.assert_status_ok();

        let body: TicketResponse = response.json();
        let ticket: crate::core::Ticket = body.ticket.parse().unwrap();
        assert_eq!(ticket.connection_id.len(), 36);
    }
}
