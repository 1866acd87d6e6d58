//! exchange-server: PostgreSQL store, Redis cache and Redis broker

use anyhow::{Context, Result};
use exchange::cache::redis::connection_info;
use exchange::cache::{RedisBroker, RedisCache};
use exchange::config::{ENV_DATABASE_URL, ENV_REDIS_URL, SockConfig};
use exchange::server::ServerBuilder;
use exchange::storage::PostgresStore;
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Path of the YAML config file; defaults apply when unset
const ENV_CONFIG_PATH: &str = "SOCK_CONFIG";
const BROKER_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var(ENV_CONFIG_PATH) {
        Ok(path) if !path.trim().is_empty() => SockConfig::from_yaml_file(&path)?,
        _ => SockConfig::default(),
    }
    .with_env_overrides()?;

    let database_url = config
        .database_url
        .clone()
        .with_context(|| format!("{ENV_DATABASE_URL} is required"))?;
    let redis_url = config
        .redis_url
        .clone()
        .with_context(|| format!("{ENV_REDIS_URL} is required"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.workers as u32 * 2)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;
    let store = PostgresStore::new(pool);
    store.migrate().await.context("running migrations")?;

    let info = connection_info(&redis_url, config.redis_pass_file.as_deref().map(Path::new))?;
    let client = redis::Client::open(info).context("opening redis client")?;
    let cache = RedisCache::connect(client.clone())
        .await?
        .with_ttl_secs(config.cache_ttl_secs);
    let broker = RedisBroker::connect(client, BROKER_CAPACITY).await?;

    let addr = config.bind_addr.clone();
    tracing::info!(workers = config.workers, "starting exchange-server");

    ServerBuilder::new()
        .with_config(config)
        .with_store(store)
        .with_cache(cache)
        .with_broker(broker)
        .serve(&addr)
        .await
}
