//! Runtime configuration, loaded from a TOML file with serde defaults.
//!
//! Every knob has a default so an empty file (or no file) yields a working
//! single-instance dev setup: in-memory storage, in-memory cache, in-process
//! relay, no mention collaborator.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unique per service instance; tags relay envelopes so a consumer can
    /// drop its own echoes.
    pub instance_id: String,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub delivery: DeliveryConfig,
    pub mentions: MentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            delivery: DeliveryConfig::default(),
            mentions: MentionConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("serialize config")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8465".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `sqlite`.
    pub backend: String,
    /// Database file for the sqlite backend.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `memory`, or `redis` when built with the `cache-redis` feature.
    pub backend: String,
    /// Connection URL for the redis backend, e.g. `redis://127.0.0.1/`.
    pub url: Option<String>,
    pub list_ttl_secs: u64,
    pub item_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: None,
            list_ttl_secs: 300,
            item_ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    pub fn item_ttl(&self) -> Duration {
        Duration::from_secs(self.item_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Broadcast attempts per message before it is marked permanently failed.
    pub max_retry_attempts: u32,
    /// Fixed delay between retry attempts and the sweep interval.
    pub retry_delay_secs: u64,
    /// Persistence attempts inside a single send.
    pub persist_attempts: u32,
    /// First backoff step for persistence retries; doubles per attempt.
    pub persist_backoff_base_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay_secs: 5,
            persist_attempts: 3,
            persist_backoff_base_ms: 1_000,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn persist_backoff_base(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MentionConfig {
    /// Mention collaborator endpoint; unset disables enrichment.
    pub endpoint: Option<String>,
    /// Local budget for one enrichment call. Dispatch is best-effort and
    /// never blocks delivery past this.
    pub timeout_ms: u64,
}

impl Default for MentionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 2_000,
        }
    }
}

impl MentionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.delivery.max_retry_attempts, 3);
        assert_eq!(config.delivery.retry_delay_secs, 5);
        assert_eq!(config.cache.list_ttl_secs, 300);
        assert_eq!(config.cache.item_ttl_secs, 3600);
        assert_eq!(config.mentions.timeout_ms, 2_000);
        assert!(!config.instance_id.is_empty());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [delivery]
            retry_delay_secs = 1

            [storage]
            backend = "sqlite"
            path = "/tmp/nosh.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.delivery.retry_delay_secs, 1);
        assert_eq!(config.delivery.max_retry_attempts, 3);
        assert_eq!(config.storage.backend, "sqlite");
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let encoded = config.to_toml().unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.instance_id, config.instance_id);
        assert_eq!(decoded.gateway.bind_addr, config.gateway.bind_addr);
    }
}
