//! Redis-backed shared cache, enabled with the `cache-redis` feature.
//!
//! Cache failures degrade to misses: every error is logged and swallowed so
//! a Redis outage slows reads down instead of failing sends.

use super::Cache;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(error) => {
                warn!(%key, %error, "cache read failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(error) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(%key, %error, "cache write failed");
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(error) = conn.del::<_, ()>(key).await {
            warn!(%key, %error, "cache delete failed");
        }
    }

    async fn delete_prefix(&self, prefix: &str) {
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = {
            let mut scan_conn = self.conn.clone();
            match scan_conn.scan_match::<_, String>(&pattern).await {
                Ok(mut iter) => {
                    let mut keys = Vec::new();
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                    keys
                }
                Err(error) => {
                    warn!(%pattern, %error, "cache scan failed");
                    return;
                }
            }
        };
        if keys.is_empty() {
            return;
        }
        let mut conn = self.conn.clone();
        if let Err(error) = conn.del::<_, ()>(keys).await {
            warn!(%pattern, %error, "cache prefix delete failed");
        }
    }
}
