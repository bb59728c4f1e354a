//! Store Module
//!
//! A store is one independent key-value instance taking part in the
//! quorum. Every operation must be atomic on the store side; the
//! compare-then-act operations in particular can never be split into a
//! read followed by a write.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RedlockConfig;
use crate::error::Result;

/// A single lock store connection
#[async_trait]
pub trait LockStore: Send + Sync + std::fmt::Debug {
    /// Address used in log lines
    fn address(&self) -> &str;

    /// Set `key` to `value` with a TTL, only if `key` does not exist
    async fn try_set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// Delete `key` only if it currently holds `expected`
    async fn try_compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the TTL of `key` only if it currently holds `expected`
    async fn try_compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl_ms: u64,
    ) -> Result<bool>;
}

/// Build one Redis store per configured endpoint, paired with its timeout.
///
/// No connection is made here; each store connects on first use.
pub fn redis_stores(config: &RedlockConfig) -> Result<Vec<(Arc<dyn LockStore>, Duration)>> {
    config
        .stores
        .iter()
        .enumerate()
        .map(|(idx, store)| {
            let timeout = config.store_timeout(idx);
            let redis_store = RedisStore::new(&store.url, timeout)?;
            Ok((Arc::new(redis_store) as Arc<dyn LockStore>, timeout))
        })
        .collect()
}
