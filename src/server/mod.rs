//! Server module: the shared host, its exposures and the builder wiring them
//!
//! - `GET /health`, `GET /healthz`: liveness
//! - `GET /api/v1/sock/ticket`: one-time handshake ticket for the session
//! - `GET /sock?ticket=..`: WebSocket upgrade

pub mod builder;
pub mod exposure;
pub mod host;

pub use builder::ServerBuilder;
pub use exposure::{RestExposure, WebSocketExposure, build_router};
pub use host::SockHost;
