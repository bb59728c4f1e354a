//! Lock Manager
//!
//! Runs the Redlock protocol over a fixed set of independent stores.
//!
//! An acquisition attempt writes a fresh random token to every store
//! with set-if-absent, then checks two things: a quorum of stores
//! accepted the write, and the time spent doing so (plus a drift
//! allowance) still leaves part of the TTL. If either check fails, the
//! attempt's token is removed from every store before the next try.
//!
//! The manager holds no per-resource state, so one instance can be
//! shared by any number of tasks.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::handle::LockHandle;
use super::token::generate_token;
use crate::config::{LockConfig, RedlockConfig};
use crate::error::{AttemptFailure, Error, Result};
use crate::quorum::{QuorumCoordinator, StoreOp};
use crate::store::{self, LockStore};
use crate::timing::TimingPolicy;

/// Distributed lock manager
pub struct LockManager {
    quorum: QuorumCoordinator,
    timing: TimingPolicy,
    retry_count: u32,
}

impl LockManager {
    /// Create a manager over `stores`, all sharing the configured store timeout
    pub fn new(stores: Vec<Arc<dyn LockStore>>, config: &LockConfig) -> Result<Self> {
        let timeout = config.store_timeout();
        Self::with_timeouts(stores.into_iter().map(|s| (s, timeout)).collect(), config)
    }

    /// Create a manager over `stores`, each with its own timeout
    pub fn with_timeouts(
        stores: Vec<(Arc<dyn LockStore>, Duration)>,
        config: &LockConfig,
    ) -> Result<Self> {
        config.validate()?;
        let quorum = QuorumCoordinator::new(stores)?;

        tracing::info!(
            "Lock manager ready: {} store(s), quorum {}",
            quorum.store_count(),
            quorum.quorum()
        );

        Ok(Self {
            quorum,
            timing: TimingPolicy::from_config(config),
            retry_count: config.retry_count,
        })
    }

    /// Create a manager talking to the Redis stores listed in `config`
    pub fn from_config(config: &RedlockConfig) -> Result<Self> {
        config.validate()?;
        Self::with_timeouts(store::redis_stores(config)?, &config.lock)
    }

    /// Number of stores that must agree
    pub fn quorum(&self) -> usize {
        self.quorum.quorum()
    }

    /// Number of configured stores
    pub fn store_count(&self) -> usize {
        self.quorum.store_count()
    }

    /// Try to lock `resource` for `ttl_ms` milliseconds.
    ///
    /// Returns [`Error::NotAcquired`] when every attempt failed, and
    /// [`Error::Config`] for an empty resource or a zero TTL.
    ///
    /// Dropping the returned future mid-attempt is safe: the attempt's
    /// token is released from every store in a background task.
    pub async fn acquire(&self, resource: &str, ttl_ms: u64) -> Result<LockHandle> {
        self.acquire_inner(&[resource], ttl_ms, None).await
    }

    /// Like [`LockManager::acquire`], but gives up with [`Error::Cancelled`]
    /// once `cancel` fires. Cancellation is observed between attempts and
    /// during the retry delay; a failed attempt is always rolled back first.
    pub async fn acquire_with_cancel(
        &self,
        resource: &str,
        ttl_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        self.acquire_inner(&[resource], ttl_ms, Some(cancel)).await
    }

    /// Lock several resources together under one token.
    ///
    /// A store counts toward the quorum only if it accepted every
    /// resource, so the returned handle holds all of them or the call
    /// fails. [`LockManager::extend`] and [`LockManager::release`] act on
    /// every resource of the handle.
    pub async fn acquire_many(&self, resources: &[&str], ttl_ms: u64) -> Result<LockHandle> {
        self.acquire_inner(resources, ttl_ms, None).await
    }

    async fn acquire_inner(
        &self,
        resources: &[&str],
        ttl_ms: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<LockHandle> {
        self.check_request(resources, ttl_ms)?;
        let label = resources.join(",");

        let mut last_failure = AttemptFailure::QuorumNotReached {
            reached: 0,
            required: self.quorum(),
        };

        for attempt in 1..=self.retry_count {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                tracing::debug!("Acquire of {} cancelled before attempt {}", label, attempt);
                return Err(Error::Cancelled);
            }

            let token = generate_token();
            let rollback = RollbackGuard::new(&self.quorum, resources, &token);
            let op = StoreOp::Acquire {
                resources,
                token: &token,
                ttl_ms,
            };

            match self.attempt(op, ttl_ms).await {
                Ok(validity_ms) => {
                    rollback.disarm();
                    let handle = LockHandle::new(
                        resources.iter().map(|r| r.to_string()).collect(),
                        token,
                        validity_ms,
                    );
                    tracing::info!(
                        "Acquired {} on attempt {} (validity {}ms)",
                        label,
                        attempt,
                        handle.validity_ms()
                    );
                    return Ok(handle);
                }
                Err(reason) => {
                    tracing::debug!(
                        "Attempt {}/{} on {} failed: {}",
                        attempt,
                        self.retry_count,
                        label,
                        reason
                    );
                    self.quorum
                        .run(StoreOp::Release {
                            resources,
                            token: &token,
                        })
                        .await;
                    rollback.disarm();
                    last_failure = reason;
                }
            }

            if attempt < self.retry_count {
                let delay = self.timing.retry_delay();
                match cancel {
                    Some(cancel) => {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                tracing::debug!("Acquire of {} cancelled while backing off", label);
                                return Err(Error::Cancelled);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }

        tracing::warn!(
            "Could not acquire {} after {} attempt(s): {}",
            label,
            self.retry_count,
            last_failure
        );
        Err(Error::NotAcquired {
            resource: label,
            attempts: self.retry_count,
            reason: last_failure,
        })
    }

    /// Push the expiry of a held lock to `new_ttl_ms` from now.
    ///
    /// Succeeds only if a quorum of stores still hold the handle's token
    /// on every resource and validity remains. On failure nothing is
    /// rolled back; stores that did extend keep the longer TTL.
    pub async fn extend(&self, handle: &LockHandle, new_ttl_ms: u64) -> Result<LockHandle> {
        let resources = resource_refs(handle);
        self.check_request(&resources, new_ttl_ms)?;

        let op = StoreOp::Extend {
            resources: &resources,
            token: handle.token(),
            ttl_ms: new_ttl_ms,
        };

        match self.attempt(op, new_ttl_ms).await {
            Ok(validity_ms) => {
                let extended = LockHandle::new(
                    handle.resources().to_vec(),
                    handle.token().to_string(),
                    validity_ms,
                );
                tracing::info!(
                    "Extended {} (validity {}ms)",
                    resources.join(","),
                    extended.validity_ms()
                );
                Ok(extended)
            }
            Err(reason) => {
                let label = resources.join(",");
                tracing::warn!("Could not extend {}: {}", label, reason);
                Err(Error::NotAcquired {
                    resource: label,
                    attempts: 1,
                    reason,
                })
            }
        }
    }

    /// Release a lock on every store that still holds its token.
    ///
    /// Best effort: store failures are logged and otherwise ignored, and
    /// releasing an expired or already released handle is a no-op.
    pub async fn release(&self, handle: &LockHandle) {
        let resources = resource_refs(handle);
        let outcome = self
            .quorum
            .run(StoreOp::Release {
                resources: &resources,
                token: handle.token(),
            })
            .await;

        tracing::info!(
            "Released {} on {}/{} store(s)",
            resources.join(","),
            outcome.succeeded,
            outcome.total()
        );
    }

    /// Acquire `resource`, run `work` with the handle, then release.
    ///
    /// The lock is released whether `work` succeeds, fails or panics.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        resource: &str,
        ttl_ms: u64,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let handle = self.acquire(resource, ttl_ms).await?;
        let result = AssertUnwindSafe(work(handle.clone())).catch_unwind().await;
        self.release(&handle).await;

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// One quorum round followed by the validity check
    async fn attempt(
        &self,
        op: StoreOp<'_>,
        ttl_ms: u64,
    ) -> std::result::Result<f64, AttemptFailure> {
        let started = Instant::now();
        let outcome = self.quorum.run(op).await;
        let validity_ms = self.timing.validity(ttl_ms, started.elapsed());

        if !outcome.reached(self.quorum()) {
            return Err(AttemptFailure::QuorumNotReached {
                reached: outcome.succeeded,
                required: self.quorum(),
            });
        }
        if validity_ms <= 0.0 {
            return Err(AttemptFailure::ValidityExhausted { validity_ms });
        }

        Ok(validity_ms)
    }

    fn check_request(&self, resources: &[&str], ttl_ms: u64) -> Result<()> {
        if resources.is_empty() {
            return Err(Error::Config("at least one resource is required".into()));
        }
        if resources.iter().any(|r| r.is_empty()) {
            return Err(Error::Config("resource name cannot be empty".into()));
        }
        if let Some((idx, dup)) = resources
            .iter()
            .enumerate()
            .find(|&(idx, r)| resources[..idx].contains(r))
        {
            return Err(Error::Config(format!(
                "resource {} is listed twice (position {})",
                dup, idx
            )));
        }
        if ttl_ms == 0 {
            return Err(Error::Config("ttl must be greater than 0".into()));
        }
        if Duration::from_millis(ttl_ms) <= self.quorum.max_timeout() {
            tracing::warn!(
                "TTL {}ms for {} is not above the store timeout {:?}; acquisition will rarely leave validity",
                ttl_ms,
                resources.join(","),
                self.quorum.max_timeout()
            );
        }
        Ok(())
    }
}

fn resource_refs(handle: &LockHandle) -> Vec<&str> {
    handle.resources().iter().map(String::as_str).collect()
}

/// Rolls back an acquisition attempt that is dropped before its outcome
/// is known, e.g. when the caller wraps `acquire` in a timeout.
struct RollbackGuard {
    quorum: QuorumCoordinator,
    resources: Vec<String>,
    token: String,
    armed: bool,
}

impl RollbackGuard {
    fn new(quorum: &QuorumCoordinator, resources: &[&str], token: &str) -> Self {
        Self {
            quorum: quorum.clone(),
            resources: resources.iter().map(|r| r.to_string()).collect(),
            token: token.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "Dropped acquire of {} outside a runtime; stores keep it until TTL",
                self.resources.join(",")
            );
            return;
        };

        let quorum = self.quorum.clone();
        let resources = std::mem::take(&mut self.resources);
        let token = std::mem::take(&mut self.token);
        tracing::debug!("Acquire of {} dropped mid-attempt, rolling back", resources.join(","));
        runtime.spawn(async move {
            let refs: Vec<&str> = resources.iter().map(String::as_str).collect();
            quorum
                .run(StoreOp::Release {
                    resources: &refs,
                    token: &token,
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock_config() -> LockConfig {
        LockConfig {
            retry_count: 3,
            retry_delay_ms: 20,
            store_timeout_ms: 50,
            ..LockConfig::default()
        }
    }

    fn memory_stores(n: usize) -> Vec<Arc<MemoryStore>> {
        (0..n)
            .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
            .collect()
    }

    fn manager(stores: &[Arc<MemoryStore>], config: &LockConfig) -> LockManager {
        LockManager::new(
            stores
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn LockStore>)
                .collect(),
            config,
        )
        .unwrap()
    }

    async fn holders(stores: &[Arc<MemoryStore>], resource: &str) -> Vec<Option<String>> {
        let mut values = Vec::new();
        for store in stores {
            values.push(store.get(resource).await);
        }
        values
    }

    #[tokio::test]
    async fn test_acquire_uncontended() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let handle = locks.acquire("X", 10_000).await.unwrap();
        assert_eq!(handle.resource(), "X");
        assert!(handle.validity() > Duration::ZERO);
        assert!(handle.validity() <= Duration::from_millis(10_000));

        for value in holders(&stores, "X").await {
            assert_eq!(value.as_deref(), Some(handle.token()));
        }
    }

    #[tokio::test]
    async fn test_contention_then_release() {
        let stores = memory_stores(3);
        let client_a = manager(&stores, &lock_config());
        let client_b = manager(&stores, &lock_config());

        let a = client_a.acquire("X", 10_000).await.unwrap();
        // ttl minus drift (10000 * 0.01 + 2) is the upper bound
        assert!(a.validity_ms() <= 9_898);
        assert!(a.validity_ms() > 9_500);

        let err = client_b.acquire("X", 10_000).await.unwrap_err();
        assert!(err.is_not_acquired());
        match err {
            Error::NotAcquired { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, AttemptFailure::QuorumNotReached { reached: 0, required: 2 });
            }
            other => panic!("unexpected error: {}", other),
        }
        // B's failed attempts left A's lock alone
        for value in holders(&stores, "X").await {
            assert_eq!(value.as_deref(), Some(a.token()));
        }

        client_a.release(&a).await;
        let b = client_b.acquire("X", 10_000).await.unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[tokio::test]
    async fn test_same_client_cannot_reacquire() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let first = locks.acquire("X", 10_000).await.unwrap();
        assert!(locks.acquire("X", 10_000).await.unwrap_err().is_not_acquired());

        locks.release(&first).await;
        let again = locks.acquire("X", 10_000).await.unwrap();
        assert_ne!(first.token(), again.token());
    }

    #[tokio::test]
    async fn test_tokens_unique_across_acquisitions() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());
        let mut tokens = std::collections::HashSet::new();

        for _ in 0..50 {
            let handle = locks.acquire("X", 1_000).await.unwrap();
            assert!(tokens.insert(handle.token().to_string()));
            locks.release(&handle).await;
        }
    }

    #[tokio::test]
    async fn test_quorum_tolerance() {
        let stores = memory_stores(5);
        let locks = manager(&stores, &lock_config());

        // N - quorum = 2 stores may be down
        stores[0].set_available(false);
        stores[1].set_available(false);
        let handle = locks.acquire("X", 5_000).await.unwrap();
        locks.release(&handle).await;

        stores[2].set_available(false);
        let err = locks.acquire("X", 5_000).await.unwrap_err();
        match err {
            Error::NotAcquired { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, AttemptFailure::QuorumNotReached { reached: 2, required: 3 });
            }
            other => panic!("unexpected error: {}", other),
        }

        // Partial locks from failed attempts were rolled back
        assert!(stores[3].is_empty().await);
        assert!(stores[4].is_empty().await);
    }

    #[tokio::test]
    async fn test_one_store_killed() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());
        stores[2].set_available(false);

        let handle = locks.acquire("Y", 5_000).await.unwrap();
        assert!(handle.validity_ms() > 4_000);
        assert_eq!(stores[0].get("Y").await.as_deref(), Some(handle.token()));
        assert_eq!(stores[1].get("Y").await.as_deref(), Some(handle.token()));
    }

    #[tokio::test]
    async fn test_recovered_store_rejoins() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        stores[0].set_available(false);
        let first = locks.acquire("X", 5_000).await.unwrap();
        assert_eq!(stores[0].get("X").await, None);
        locks.release(&first).await;

        stores[0].set_available(true);
        let second = locks.acquire("X", 5_000).await.unwrap();
        assert_eq!(stores[0].get("X").await.as_deref(), Some(second.token()));
    }

    #[tokio::test]
    async fn test_dropped_acquire_is_rolled_back() {
        let stores = memory_stores(3);
        let config = LockConfig {
            store_timeout_ms: 500,
            ..lock_config()
        };
        let locks = manager(&stores, &config);
        for store in &stores {
            store.set_reply_latency(Duration::from_millis(100));
        }

        // Every store takes the write, then the caller gives up waiting
        let result = tokio::time::timeout(Duration::from_millis(20), locks.acquire("X", 10_000)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        for store in &stores {
            assert!(store.is_empty().await, "{} kept a stale lock", store.address());
            store.set_reply_latency(Duration::ZERO);
        }

        let other = manager(&stores, &lock_config());
        assert!(other.acquire("X", 10_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_store_exhausts_validity() {
        let stores = memory_stores(3);
        let config = LockConfig {
            retry_count: 2,
            retry_delay_ms: 10,
            store_timeout_ms: 500,
            ..LockConfig::default()
        };
        let locks = manager(&stores, &config);
        stores[0].set_reply_latency(Duration::from_millis(150));

        let err = locks.acquire("Z", 100).await.unwrap_err();
        match err {
            Error::NotAcquired { reason, .. } => {
                assert!(matches!(reason, AttemptFailure::ValidityExhausted { validity_ms } if validity_ms <= 0.0));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_attempt_is_rolled_back() {
        let stores = memory_stores(3);
        // A drift allowance of 990ms on a 1000ms TTL leaves less than the
        // slow store's reply time, while the records themselves stay live.
        let config = LockConfig {
            drift_factor: 0.99,
            retry_count: 1,
            store_timeout_ms: 500,
            ..LockConfig::default()
        };
        let locks = manager(&stores, &config);
        stores[0].set_reply_latency(Duration::from_millis(30));

        let err = locks.acquire("Z", 1_000).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotAcquired { reason: AttemptFailure::ValidityExhausted { .. }, .. }
        ));
        for store in &stores {
            assert!(store.is_empty().await, "{} kept a stale lock", store.address());
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_safe() {
        let stores = memory_stores(3);
        let client_a = manager(&stores, &lock_config());
        let client_b = manager(&stores, &lock_config());

        let a = client_a.acquire("X", 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.is_expired());

        let b = client_b.acquire("X", 10_000).await.unwrap();

        // A's stale handle must not remove B's lock
        client_a.release(&a).await;
        client_a.release(&a).await;
        for value in holders(&stores, "X").await {
            assert_eq!(value.as_deref(), Some(b.token()));
        }

        client_b.release(&b).await;
        client_b.release(&b).await;
        for store in &stores {
            assert!(store.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_release_with_store_down() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let handle = locks.acquire("X", 10_000).await.unwrap();
        stores[1].set_available(false);
        locks.release(&handle).await;

        assert!(stores[0].is_empty().await);
        assert!(stores[2].is_empty().await);
    }

    #[tokio::test]
    async fn test_extend_held_lock() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let handle = locks.acquire("X", 200).await.unwrap();
        let extended = locks.extend(&handle, 10_000).await.unwrap();

        assert_eq!(extended, handle);
        assert_eq!(extended.resource(), "X");
        assert!(extended.validity_ms() > 9_000);
        for store in &stores {
            assert!(store.ttl("X").await.unwrap() > Duration::from_millis(5_000));
        }

        // The lock outlives the original TTL
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(locks.acquire("X", 1_000).await.unwrap_err().is_not_acquired());
    }

    #[tokio::test]
    async fn test_extend_after_takeover_fails() {
        let stores = memory_stores(3);
        let client_a = manager(&stores, &lock_config());
        let client_b = manager(&stores, &lock_config());

        let a = client_a.acquire("X", 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let b = client_b.acquire("X", 10_000).await.unwrap();

        let err = client_a.extend(&a, 60_000).await.unwrap_err();
        match err {
            Error::NotAcquired { attempts, reason, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, AttemptFailure::QuorumNotReached { reached: 0, required: 2 });
            }
            other => panic!("unexpected error: {}", other),
        }

        // B's lock is untouched, TTL included
        for store in &stores {
            assert_eq!(store.get("X").await.as_deref(), Some(b.token()));
            assert!(store.ttl("X").await.unwrap() <= Duration::from_millis(10_000));
        }
    }

    #[tokio::test]
    async fn test_extend_without_quorum_fails() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let handle = locks.acquire("X", 5_000).await.unwrap();
        stores[0].set_available(false);
        stores[1].set_available(false);

        assert!(locks.extend(&handle, 10_000).await.unwrap_err().is_not_acquired());
        // The store that did extend keeps the longer TTL
        assert!(stores[2].ttl("X").await.unwrap() > Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        assert!(matches!(locks.acquire("", 1_000).await, Err(Error::Config(_))));
        assert!(matches!(locks.acquire("X", 0).await, Err(Error::Config(_))));

        let handle = locks.acquire("X", 1_000).await.unwrap();
        assert!(matches!(locks.extend(&handle, 0).await, Err(Error::Config(_))));

        assert!(matches!(
            LockManager::new(Vec::new(), &lock_config()),
            Err(Error::Config(_))
        ));

        let config = LockConfig {
            retry_count: 0,
            ..LockConfig::default()
        };
        let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new("mem"));
        assert!(matches!(LockManager::new(vec![store], &config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_first_attempt() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = locks.acquire_with_cancel("X", 1_000, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        for store in &stores {
            assert!(store.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_rolls_back() {
        let stores = memory_stores(3);
        let config = LockConfig {
            retry_count: 10,
            retry_delay_ms: 2_000,
            ..lock_config()
        };
        let locks = manager(&stores, &config);

        // Someone else holds two of three stores
        stores[0].try_set_if_absent("X", "other", 10_000).await.unwrap();
        stores[1].try_set_if_absent("X", "other", 10_000).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = locks.acquire_with_cancel("X", 1_000, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(900));

        // The attempt that won only the third store was undone
        assert!(stores[2].is_empty().await);
        assert_eq!(stores[0].get("X").await.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_success_and_error() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        let token = locks
            .with_lock("X", 5_000, |handle| async move {
                Ok::<_, Error>(handle.token().to_string())
            })
            .await
            .unwrap();
        assert_eq!(token.len(), 32);
        for store in &stores {
            assert!(store.is_empty().await);
        }

        let result: Result<()> = locks
            .with_lock("X", 5_000, |_| async { Err(Error::Internal("work failed".into())) })
            .await;
        assert!(matches!(result, Err(Error::Internal(_))));
        for store in &stores {
            assert!(store.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let stores = memory_stores(3);
        let locks = Arc::new(manager(&stores, &lock_config()));

        let task_locks = Arc::clone(&locks);
        let joined = tokio::spawn(async move {
            task_locks
                .with_lock("X", 5_000, |_| async {
                    if true {
                        panic!("protected work blew up");
                    }
                    Ok::<(), Error>(())
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        for store in &stores {
            assert!(store.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_with_lock_not_acquired() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());
        let _held = locks.acquire("X", 10_000).await.unwrap();

        let ran = std::sync::atomic::AtomicBool::new(false);
        let ran_ref = &ran;
        let result = locks
            .with_lock("X", 1_000, move |_| async move {
                ran_ref.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), Error>(())
            })
            .await;

        assert!(result.unwrap_err().is_not_acquired());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_contenders_single_winner() {
        let stores = memory_stores(3);
        let config = LockConfig {
            retry_count: 1,
            ..lock_config()
        };
        let locks = Arc::new(manager(&stores, &config));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            tasks.spawn(async move { locks.acquire("X", 10_000).await });
        }

        let mut winners = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(handle) => winners.push(handle),
                Err(e) => assert!(e.is_not_acquired(), "unexpected error: {}", e),
            }
        }

        assert!(winners.len() <= 1, "{} clients hold the lock", winners.len());
        if let Some(winner) = winners.first() {
            let held = holders(&stores, "X")
                .await
                .into_iter()
                .filter(|v| v.as_deref() == Some(winner.token()))
                .count();
            assert!(held >= 2);
        }
    }

    #[tokio::test]
    async fn test_acquire_many_lifecycle() {
        let stores = memory_stores(3);
        let client_a = manager(&stores, &lock_config());
        let client_b = manager(&stores, &lock_config());

        let a = client_a.acquire_many(&["A", "B", "C"], 2_000).await.unwrap();
        assert_eq!(a.resources().len(), 3);
        for resource in ["A", "B", "C"] {
            for value in holders(&stores, resource).await {
                assert_eq!(value.as_deref(), Some(a.token()));
            }
        }

        // Any overlap blocks another client, and its partial writes are undone
        assert!(client_b.acquire("B", 1_000).await.unwrap_err().is_not_acquired());
        let err = client_b.acquire_many(&["C", "D"], 1_000).await.unwrap_err();
        assert!(err.is_not_acquired());
        for store in &stores {
            assert_eq!(store.get("D").await, None);
        }

        // Extension covers every resource
        let extended = client_a.extend(&a, 10_000).await.unwrap();
        assert_eq!(extended, a);
        for store in &stores {
            for resource in ["A", "B", "C"] {
                assert!(store.ttl(resource).await.unwrap() > Duration::from_millis(5_000));
            }
        }

        client_a.release(&extended).await;
        for store in &stores {
            assert!(store.is_empty().await);
        }
        assert!(client_b.acquire_many(&["C", "D"], 1_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_many_tolerates_minority_conflict() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        // One store has B under a foreign token; it cannot count toward quorum
        stores[2].try_set_if_absent("B", "other", 10_000).await.unwrap();

        let handle = locks.acquire_many(&["A", "B"], 5_000).await.unwrap();
        assert_eq!(stores[2].get("A").await, None);
        assert_eq!(stores[2].get("B").await.as_deref(), Some("other"));
        for store in &stores[..2] {
            assert_eq!(store.get("A").await.as_deref(), Some(handle.token()));
            assert_eq!(store.get("B").await.as_deref(), Some(handle.token()));
        }

        stores[1].try_set_if_absent("C", "other", 10_000).await.unwrap();
        stores[0].try_set_if_absent("C", "other", 10_000).await.unwrap();
        let err = locks.acquire_many(&["D", "C"], 5_000).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotAcquired {
                reason: AttemptFailure::QuorumNotReached { reached: 1, required: 2 },
                ..
            }
        ));
        for store in &stores {
            assert_eq!(store.get("D").await, None);
        }
    }

    #[tokio::test]
    async fn test_acquire_many_invalid_requests() {
        let stores = memory_stores(3);
        let locks = manager(&stores, &lock_config());

        assert!(matches!(locks.acquire_many(&[], 1_000).await, Err(Error::Config(_))));
        assert!(matches!(locks.acquire_many(&["A", ""], 1_000).await, Err(Error::Config(_))));
        assert!(matches!(locks.acquire_many(&["A", "B", "A"], 1_000).await, Err(Error::Config(_))));
        for store in &stores {
            assert!(store.is_empty().await);
        }
    }
}
