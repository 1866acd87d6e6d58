//! API exposures
//!
//! Each exposure consumes a [`SockHost`] and produces a Router for its
//! protocol. [`build_router`] merges them behind the HTTP trace layer.

pub mod rest;
pub mod websocket;

pub use rest::RestExposure;
pub use websocket::WebSocketExposure;

use crate::server::host::SockHost;
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// REST + WebSocket on one router
pub fn build_router(host: Arc<SockHost>, custom_routes: Vec<Router>) -> Result<Router> {
    let rest = RestExposure::build_router(host.clone(), custom_routes)?;
    let websocket = WebSocketExposure::build_router(host)?;

    Ok(rest
        .merge(websocket)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http())))
}
