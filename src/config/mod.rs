//! Configuration loading and management

use crate::registry::RegistryConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_REDIS_PASS_FILE: &str = "REDIS_PASS_FILE";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_BIND_ADDR: &str = "SOCK_BIND_ADDR";
pub const ENV_WORKERS: &str = "SOCK_WORKERS";

/// Settings for the messaging core and its hosting binary
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "check_keepalive"))]
pub struct SockConfig {
    /// Listener address of the hosting binary
    pub bind_addr: String,

    /// Registry worker count
    #[validate(range(min = 1))]
    pub workers: usize,

    /// Bounded capacity of each worker queue
    #[validate(range(min = 1))]
    pub command_buffer: usize,

    /// Send and receive timeout for registry commands
    #[validate(range(min = 1))]
    pub command_timeout_ms: u64,

    #[validate(range(min = 1))]
    pub ping_interval_secs: u64,

    /// Read deadline, refreshed by every received frame
    #[validate(range(min = 1))]
    pub idle_timeout_secs: u64,

    /// Maximum age of an unconsumed ticket
    #[validate(range(min = 1))]
    pub ticket_ttl_secs: u64,

    #[validate(range(min = 1))]
    pub cache_ttl_secs: u64,

    /// Inbound frames longer than this are dropped unparsed
    #[validate(range(min = 1))]
    pub max_frame_bytes: usize,

    /// Upper bound for LOAD_MESSAGES pageSize
    #[validate(range(min = 1))]
    pub max_page_size: i64,

    /// Period of the registry report and ticket sweep
    #[validate(range(min = 1))]
    pub report_interval_secs: u64,

    /// Either `host:port` or a `redis://` URL
    pub redis_url: Option<String>,

    /// File whose first line is the Redis password
    pub redis_pass_file: Option<String>,

    pub database_url: Option<String>,
}

impl Default for SockConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7443".to_string(),
            workers: 10,
            command_buffer: 10,
            command_timeout_ms: 5000,
            ping_interval_secs: 30,
            idle_timeout_secs: 90,
            ticket_ttl_secs: 60,
            cache_ttl_secs: 86_400,
            max_frame_bytes: 65_535,
            max_page_size: 100,
            report_interval_secs: 3600,
            redis_url: None,
            redis_pass_file: None,
            database_url: None,
        }
    }
}

fn check_keepalive(config: &SockConfig) -> Result<(), ValidationError> {
    if config.ping_interval_secs >= config.idle_timeout_secs {
        let mut err = ValidationError::new("keepalive");
        err.message = Some("ping_interval_secs must be shorter than idle_timeout_secs".into());
        return Err(err);
    }
    Ok(())
}

impl SockConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `REDIS_URL`, `REDIS_PASS_FILE`, `DATABASE_URL`, `SOCK_BIND_ADDR` and `SOCK_WORKERS`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`with_env_overrides`](Self::with_env_overrides) with an explicit lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.redis_url = Some(url);
        }
        if let Some(path) = lookup(ENV_REDIS_PASS_FILE) {
            self.redis_pass_file = Some(path);
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("{ENV_WORKERS} is not a number: {workers}"))?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            workers: self.workers,
            buffer: self.command_buffer,
            timeout: Duration::from_millis(self.command_timeout_ms),
            ticket_ttl: self.ticket_ttl(),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Clamp a requested page size to `[1, max_page_size]`
    pub fn clamp_page_size(&self, requested: i64) -> i64 {
        requested.clamp(1, self.max_page_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = SockConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 10);
        assert_eq!(config.idle_timeout(), Duration::from_secs(90));

        let registry = config.registry_config();
        assert_eq!(registry.timeout, Duration::from_secs(5));
        assert_eq!(registry.ticket_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SockConfig::from_yaml_str(
            "workers: 4\nidle_timeout_secs: 120\nredis_url: cache:6379\n",
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.idle_timeout_secs, 120);
        assert_eq!(config.ping_interval_secs, 30);
        assert_eq!(config.redis_url.as_deref(), Some("cache:6379"));
    }

    #[test]
    fn test_sample_config_file() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/sock.yaml");
        let config = SockConfig::from_yaml_file(path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7443");
        assert_eq!(config.cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.redis_url, None);
    }

    #[test]
    fn test_rejects_zero_workers_and_buffers() {
        assert!(SockConfig::from_yaml_str("workers: 0").is_err());
        assert!(SockConfig::from_yaml_str("command_buffer: 0").is_err());
        assert!(SockConfig::from_yaml_str("max_page_size: 0").is_err());
    }

    #[test]
    fn test_rejects_ping_not_shorter_than_idle() {
        let err = SockConfig::from_yaml_str("ping_interval_secs: 90\nidle_timeout_secs: 90")
            .unwrap_err();
        assert!(err.to_string().contains("idle_timeout_secs"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_REDIS_URL, "redis://cache:6379"),
            (ENV_DATABASE_URL, "postgres://db/app"),
            (ENV_BIND_ADDR, "127.0.0.1:9000"),
            (ENV_WORKERS, "3"),
            (ENV_REDIS_PASS_FILE, "  "),
        ]);

        let config = SockConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://db/app"));
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.workers, 3);
        assert_eq!(config.redis_pass_file, None);
    }

    #[test]
    fn test_override_with_bad_worker_count() {
        let result = SockConfig::default()
            .with_overrides(|k| (k == ENV_WORKERS).then(|| "many".to_string()));
        assert!(result.is_err());

        let result = SockConfig::default()
            .with_overrides(|k| (k == ENV_WORKERS).then(|| "0".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_page_size_clamp() {
        let config = SockConfig::default();
        assert_eq!(config.clamp_page_size(0), 1);
        assert_eq!(config.clamp_page_size(-5), 1);
        assert_eq!(config.clamp_page_size(20), 20);
        assert_eq!(config.clamp_page_size(1000), 100);
    }
}
