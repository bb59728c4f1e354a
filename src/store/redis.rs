//! Redis Store
//!
//! Lock operations against a single Redis instance. Acquisition is a
//! plain `SET key value NX PX ttl`; release and extension run as Lua
//! scripts so the token check and the write happen in one step.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::LockStore;
use crate::error::{Error, Result};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lock store backed by one Redis instance
pub struct RedisStore {
    /// Endpoint URL as configured
    address: String,
    /// Client used to (re)open the connection
    client: Client,
    /// Lazily established multiplexed connection
    connection: Mutex<Option<ConnectionManager>>,
    /// Budget for establishing the connection
    connect_timeout: Duration,
    release_script: Script,
    extend_script: Script,
}

impl RedisStore {
    /// Create a store for `url`. The URL is parsed here, the connection
    /// is opened on first use.
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| Error::Config(format!("invalid store url '{}': {}", url, e)))?;

        Ok(Self {
            address: url.to_string(),
            client,
            connection: Mutex::new(None),
            connect_timeout,
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    /// Get the shared connection, connecting if needed
    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = match timeout(self.connect_timeout, self.client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(Error::Redis(e)),
            Err(_) => return Err(Error::ConnectionTimeout(self.address.clone())),
        };
        tracing::debug!("Connected to store {}", self.address);

        *slot = Some(conn.clone());
        Ok(conn)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("address", &self.address)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl LockStore for RedisStore {
    fn address(&self) -> &str {
        &self.address
    }

    async fn try_set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn try_compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn try_compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl_ms: u64,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        let updated: i64 = self
            .extend_script
            .key(key)
            .arg(expected)
            .arg(new_ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }
}
