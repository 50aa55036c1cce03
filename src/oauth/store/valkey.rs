//! Valkey / Redis credential store.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{KvStore, StorageError};
use crate::config::ValkeyConfig;

/// Networked store speaking the Redis protocol
pub struct ValkeyStore {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    key_prefix: String,
    timeout: Duration,
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Backend(e.to_string())
        }
    }
}

/// Build a `redis://` / `rediss://` URL from the configured pieces.
fn connection_url(config: &ValkeyConfig) -> Result<String, StorageError> {
    let scheme = if config.tls { "rediss" } else { "redis" };
    let address = config
        .url
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://")
        .trim_end_matches('/');
    let mut url = url::Url::parse(&format!("{scheme}://{address}/{}", config.db))
        .map_err(|e| StorageError::Backend(format!("invalid valkey url: {e}")))?;
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        url.set_password(Some(password))
            .map_err(|()| StorageError::Backend("invalid valkey url: cannot carry a password".to_string()))?;
    }
    Ok(url.to_string())
}

impl ValkeyStore {
    /// Create the client and verify connectivity
    pub async fn connect(config: &ValkeyConfig) -> Result<Self, StorageError> {
        let client = redis::Client::open(connection_url(config)?)?;
        let store = Self {
            client,
            connection: OnceCell::new(),
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout,
        };
        store.conn().await?;
        info!(tls = config.tls, db = config.db, prefix = %config.key_prefix, "Connected to valkey credential store");
        Ok(store)
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StorageError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
                    .await
                    .map_err(|_| StorageError::Timeout)?
                    .map_err(StorageError::from)
            })
            .await?;
        Ok(conn.clone())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout)?
            .map_err(StorageError::from)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for ValkeyStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let key = self.key(key);
        match ttl {
            Some(ttl) => self.bounded(conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl))).await,
            None => self.bounded(conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.conn().await?;
        self.bounded(conn.get(self.key(key))).await
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("GETDEL");
        cmd.arg(self.key(key));
        let value: Option<Vec<u8>> = self.bounded(cmd.query_async(&mut conn)).await?;
        debug!(found = value.is_some(), "valkey GETDEL");
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.bounded(conn.del(self.key(key))).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        self.bounded(conn.exists(self.key(key))).await
    }

    fn backend_name(&self) -> &'static str {
        "valkey"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> ValkeyConfig {
        ValkeyConfig {
            url: url.to_string(),
            ..ValkeyConfig::default()
        }
    }

    #[test]
    fn url_from_host_port() {
        assert_eq!(connection_url(&config("valkey:6379")).unwrap(), "redis://valkey:6379/0");
    }

    #[test]
    fn url_with_tls_password_and_db() {
        let mut c = config("redis://valkey.svc:6380");
        c.tls = true;
        c.db = 3;
        c.password = Some("p@ss".to_string());
        assert_eq!(connection_url(&c).unwrap(), "rediss://:p%40ss@valkey.svc:6380/3");
    }
}
