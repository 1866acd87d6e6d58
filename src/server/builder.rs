//! ServerBuilder for fluent API to build the messaging server

use super::exposure;
use super::host::SockHost;
use crate::cache::{CacheIndex, InMemoryCache};
use crate::config::SockConfig;
use crate::core::{FrameBroker, HeaderSessionProvider, LocalBroker, SessionProvider};
use crate::storage::{InMemoryStore, MessageStore};
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Builder for the host and its router
///
/// Every backend has an in-process default, so `ServerBuilder::new().build()`
/// yields a working single-process server.
///
/// # Example
///
/// ```ignore
/// ServerBuilder::new()
///     .with_config(config)
///     .with_store(PostgresStore::new(pool))
///     .with_cache(RedisCache::connect(client.clone()).await?)
///     .with_broker(RedisBroker::connect(client, 1024).await?)
///     .serve("0.0.0.0:7443")
///     .await?;
/// ```
#[derive(Default)]
pub struct ServerBuilder {
    config: Option<SockConfig>,
    cache: Option<Arc<dyn CacheIndex>>,
    store: Option<Arc<dyn MessageStore>>,
    broker: Option<Arc<dyn FrameBroker>>,
    sessions: Option<Arc<dyn SessionProvider>>,
    custom_routes: Vec<Router>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: SockConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cache(mut self, cache: impl CacheIndex + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn with_store(mut self, store: impl MessageStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Cross-process delivery; defaults to a broker local to this process
    pub fn with_broker(mut self, broker: impl FrameBroker + 'static) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Resolves identities on the ticket endpoint; defaults to proxy headers
    pub fn with_session_provider(mut self, provider: impl SessionProvider + 'static) -> Self {
        self.sessions = Some(Arc::new(provider));
        self
    }

    /// Extra routes merged into the REST router
    pub fn with_custom_routes(mut self, routes: Router) -> Self {
        self.custom_routes.push(routes);
        self
    }

    /// Build the host, prepare the backends and start background tasks
    pub async fn build_host(self) -> Result<Arc<SockHost>> {
        Ok(self.into_parts().await?.0)
    }

    /// Build the REST + WebSocket router
    pub async fn build(self) -> Result<Router> {
        let (host, custom_routes) = self.into_parts().await?;
        exposure::build_router(host, custom_routes)
    }

    /// Serve the application with graceful shutdown on SIGINT and SIGTERM
    pub async fn serve(self, addr: &str) -> Result<()> {
        let (host, custom_routes) = self.into_parts().await?;
        let app = exposure::build_router(host.clone(), custom_routes)?;
        let listener = TcpListener::bind(addr).await?;

        tracing::info!(addr = %addr, instance = %host.instance_id(), "server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        host.shutdown();
        tracing::info!("server shutdown complete");
        Ok(())
    }

    async fn into_parts(self) -> Result<(Arc<SockHost>, Vec<Router>)> {
        let config = self.config.unwrap_or_default();
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryCache::with_ttl(config.cache_ttl())));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(LocalBroker::default()));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(HeaderSessionProvider));

        let host = SockHost::from_builder_components(config, cache, store, broker, sessions);
        host.init().await?;
        host.start_background();

        Ok((Arc::new(host), self.custom_routes))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
