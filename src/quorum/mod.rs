//! Quorum Coordination
//!
//! Fans one lock operation out to every configured store in parallel and
//! counts how many stores applied it. A store that errors or exceeds its
//! timeout simply does not count; deciding whether enough stores agreed
//! is left to the quorum threshold.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::store::LockStore;

/// One operation to apply on every store.
///
/// Each operation covers one or more resources under a single token. A
/// store counts toward the quorum only when it applied the operation to
/// every resource.
#[derive(Debug, Clone, Copy)]
pub enum StoreOp<'a> {
    /// Set-if-absent with expiry
    Acquire {
        resources: &'a [&'a str],
        token: &'a str,
        ttl_ms: u64,
    },
    /// Compare token, then refresh expiry
    Extend {
        resources: &'a [&'a str],
        token: &'a str,
        ttl_ms: u64,
    },
    /// Compare token, then delete
    Release {
        resources: &'a [&'a str],
        token: &'a str,
    },
}

impl<'a> StoreOp<'a> {
    /// Operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::Acquire { .. } => "acquire",
            StoreOp::Extend { .. } => "extend",
            StoreOp::Release { .. } => "release",
        }
    }

    async fn apply(&self, store: &dyn LockStore) -> Result<bool> {
        match *self {
            StoreOp::Acquire {
                resources,
                token,
                ttl_ms,
            } => {
                for (idx, resource) in resources.iter().enumerate() {
                    let result = store.try_set_if_absent(resource, token, ttl_ms).await;
                    if !matches!(result, Ok(true)) {
                        // Keys taken before the refusal must not outlive it
                        for taken in &resources[..idx] {
                            if let Err(e) = store.try_compare_and_delete(taken, token).await {
                                tracing::debug!(
                                    "undo of {} on {} failed: {}",
                                    taken,
                                    store.address(),
                                    e
                                );
                            }
                        }
                        return result;
                    }
                }
                Ok(true)
            }
            StoreOp::Extend {
                resources,
                token,
                ttl_ms,
            } => {
                for resource in resources {
                    if !store.try_compare_and_expire(resource, token, ttl_ms).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            StoreOp::Release { resources, token } => {
                let mut released = true;
                let mut failure = None;
                for resource in resources {
                    match store.try_compare_and_delete(resource, token).await {
                        Ok(deleted) => released &= deleted,
                        Err(e) => failure = Some(e),
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(released),
                }
            }
        }
    }
}

/// Aggregated result of one fan-out round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Stores that applied the operation
    pub succeeded: usize,
    /// Stores that answered but refused (key held by another token, or absent)
    pub rejected: usize,
    /// Stores that errored or timed out
    pub failed: usize,
}

impl RoundOutcome {
    /// Whether at least `quorum` stores applied the operation
    pub fn reached(&self, quorum: usize) -> bool {
        self.succeeded >= quorum
    }

    /// Total stores contacted
    pub fn total(&self) -> usize {
        self.succeeded + self.rejected + self.failed
    }
}

struct StoreSlot {
    store: Arc<dyn LockStore>,
    timeout: Duration,
}

/// Fans lock operations out to all stores and counts agreements.
///
/// Cloning is cheap and shares the same stores.
#[derive(Clone)]
pub struct QuorumCoordinator {
    stores: Arc<[StoreSlot]>,
    quorum: usize,
}

impl QuorumCoordinator {
    /// Create a coordinator over `stores`, each with its own call timeout.
    /// The quorum is fixed here at `floor(N/2) + 1`.
    pub fn new(stores: Vec<(Arc<dyn LockStore>, Duration)>) -> Result<Self> {
        if stores.is_empty() {
            return Err(Error::Config("at least one store is required".into()));
        }
        if let Some((store, _)) = stores.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::Config(format!(
                "store {} has a zero timeout",
                store.address()
            )));
        }

        let quorum = stores.len() / 2 + 1;
        let stores = stores
            .into_iter()
            .map(|(store, timeout)| StoreSlot { store, timeout })
            .collect::<Vec<_>>()
            .into();

        Ok(Self { stores, quorum })
    }

    /// Number of stores that must agree
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Number of configured stores
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Longest per-store timeout
    pub fn max_timeout(&self) -> Duration {
        self.stores
            .iter()
            .map(|s| s.timeout)
            .max()
            .unwrap_or_default()
    }

    /// Apply `op` on every store concurrently and count the results.
    ///
    /// Never fails: store errors and timeouts are counted in
    /// [`RoundOutcome::failed`].
    pub async fn run(&self, op: StoreOp<'_>) -> RoundOutcome {
        let calls = self.stores.iter().map(|slot| async move {
            let result = timeout(slot.timeout, op.apply(slot.store.as_ref())).await;
            (slot, result)
        });

        let mut outcome = RoundOutcome::default();
        for (slot, result) in join_all(calls).await {
            let address = slot.store.address();
            match result {
                Ok(Ok(true)) => {
                    outcome.succeeded += 1;
                    tracing::trace!("{} applied on {}", op.name(), address);
                }
                Ok(Ok(false)) => {
                    outcome.rejected += 1;
                    tracing::trace!("{} rejected by {}", op.name(), address);
                }
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    log_store_failure(op, address, &e.to_string());
                }
                Err(_) => {
                    outcome.failed += 1;
                    log_store_failure(
                        op,
                        address,
                        &format!("timed out after {:?}", slot.timeout),
                    );
                }
            }
        }

        tracing::debug!(
            "{} round: {}/{} succeeded, {} rejected, {} failed (quorum {})",
            op.name(),
            outcome.succeeded,
            outcome.total(),
            outcome.rejected,
            outcome.failed,
            self.quorum
        );

        outcome
    }
}

fn log_store_failure(op: StoreOp<'_>, address: &str, reason: &str) {
    match op {
        // Unreachable stores are expected during rollback; their record expires on its own
        StoreOp::Release { .. } => {
            tracing::debug!("release on {} failed: {}", address, reason)
        }
        _ => tracing::warn!("{} on {} failed: {}", op.name(), address, reason),
    }
}
