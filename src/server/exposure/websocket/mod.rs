//! WebSocket exposure: the connection orchestrator
//!
//! # Architecture
//!
//! ```text
//! Client ──ws──▶ /sock?ticket=.. ──▶ ws_handler() ──▶ connection::serve()
//!                                                        │
//!                                          read loop ──▶ router (per frame)
//!                                                        │
//!                          Registry / CacheIndex / MessageStore / FrameBroker
//! ```
//!
//! After the upgrade every message, in both directions, is a binary frame as
//! described in [`crate::core::frame`]. Frames that happen to be valid UTF-8
//! are sent as text messages; both kinds are accepted from clients.

mod connection;
mod handler;
mod router;

pub use connection::{CloseReason, ConnectionState};

use crate::server::host::SockHost;
use anyhow::Result;
use axum::{Router, routing::get};
use std::sync::Arc;

/// Path of the upgrade endpoint
pub const SOCKET_PATH: &str = "/sock";

pub struct WebSocketExposure;

impl WebSocketExposure {
    /// Build the router serving [`SOCKET_PATH`]
    pub fn build_router(host: Arc<SockHost>) -> Result<Router> {
        let router = Router::new()
            .route(SOCKET_PATH, get(handler::ws_handler))
            .with_state(host);
        Ok(router)
    }
}
