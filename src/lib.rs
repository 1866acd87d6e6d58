//! # Topic Exchange
//!
//! Real-time messaging core for booking exchanges. Authenticated clients hold
//! long-lived WebSocket sessions, subscribe to topics, and exchange compact
//! binary frames that are relayed to every participant of a topic, on this
//! process or any other.
//!
//! ## Components
//!
//! - **Frame codec** ([`core::frame`]): five length-prefixed fields per message
//! - **Registry** ([`registry`]): per-process tickets, connections and topic
//!   subscriptions, owned by a pool of workers
//! - **Cache index** ([`cache`]): cross-process participant sets (in-memory or Redis)
//! - **Message store** ([`storage`]): durable topic log and booking
//!   authorization (in-memory or PostgreSQL)
//! - **Server** ([`server`]): ticket endpoint and the WebSocket orchestrator
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use exchange::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     ServerBuilder::new()
//!         .with_config(SockConfig::default())
//!         .serve("127.0.0.1:7443")
//!         .await
//! }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod registry;
pub mod server;
pub mod storage;

/// Re-exports of commonly used types and traits
pub mod prelude {
    // === Core ===
    pub use crate::core::{
        ExchangeClass, ExchangeTopic, FrameBroker, FrameEnvelope, FrameRef,
        HeaderSessionProvider, LocalBroker, Participant, Participants, SessionIdentity,
        SessionProvider, SockError, SocketAction, SocketId, SocketMessage, Targets, Ticket,
    };

    // === Registry ===
    pub use crate::registry::{Registry, RegistryConfig, SendReport};

    // === Backends ===
    pub use crate::cache::{CacheIndex, InMemoryCache};
    #[cfg(feature = "redis")]
    pub use crate::cache::{RedisBroker, RedisCache};
    pub use crate::storage::{InMemoryStore, MessageStore};
    #[cfg(feature = "postgres")]
    pub use crate::storage::PostgresStore;

    // === Config ===
    pub use crate::config::SockConfig;

    // === Server ===
    pub use crate::server::{ServerBuilder, SockHost};

    // === External dependencies ===
    pub use anyhow::Result;
    pub use async_trait::async_trait;
    pub use uuid::Uuid;
}
