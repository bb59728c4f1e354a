//! In-process lock store
//!
//! Behaves like a single Redis instance for the three lock operations,
//! with expiry driven by a monotonic clock. Faults can be injected to
//! make the store unreachable or slow to reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::LockStore;
use crate::error::{Error, Result};

#[derive(Debug)]
struct Record {
    value: String,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory lock store
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    records: Mutex<HashMap<String, Record>>,
    available: AtomicBool,
    /// Extra delay before each reply, in milliseconds
    reply_latency_ms: AtomicU64,
}

impl MemoryStore {
    /// Create an empty, reachable store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            reply_latency_ms: AtomicU64::new(0),
        }
    }

    /// Make the store reachable or not. An unreachable store fails every call.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every reply. The operation is applied before the delay.
    pub fn set_reply_latency(&self, latency: Duration) {
        self.reply_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Current live value of `key`
    pub async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.records
            .lock()
            .await
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.value.clone())
    }

    /// Remaining TTL of `key`
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .lock()
            .await
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.expires_at - now)
    }

    /// Number of live records
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.is_live(now))
            .count()
    }

    /// Whether the store holds no live records
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(self.name.clone()))
        }
    }

    async fn reply<T>(&self, value: T) -> Result<T> {
        let latency = self.reply_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(value)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    fn address(&self) -> &str {
        &self.name
    }

    async fn try_set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        self.check_available()?;

        let set = {
            let now = Instant::now();
            let mut records = self.records.lock().await;
            match records.get(key) {
                Some(existing) if existing.is_live(now) => false,
                _ => {
                    records.insert(
                        key.to_string(),
                        Record {
                            value: value.to_string(),
                            expires_at: now + Duration::from_millis(ttl_ms),
                        },
                    );
                    true
                }
            }
        };

        self.reply(set).await
    }

    async fn try_compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_available()?;

        let deleted = {
            let now = Instant::now();
            let mut records = self.records.lock().await;
            match records.get(key) {
                Some(existing) if existing.is_live(now) && existing.value == expected => {
                    records.remove(key);
                    true
                }
                Some(existing) if !existing.is_live(now) => {
                    records.remove(key);
                    false
                }
                _ => false,
            }
        };

        self.reply(deleted).await
    }

    async fn try_compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl_ms: u64,
    ) -> Result<bool> {
        self.check_available()?;

        let extended = {
            let now = Instant::now();
            let mut records = self.records.lock().await;
            match records.get_mut(key) {
                Some(existing) if existing.is_live(now) && existing.value == expected => {
                    existing.expires_at = now + Duration::from_millis(new_ttl_ms);
                    true
                }
                _ => false,
            }
        };

        self.reply(extended).await
    }
}
