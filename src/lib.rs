//! Redlock - Distributed Locks over Independent Redis Instances
//!
//! An implementation of the Redlock algorithm: a mutual-exclusion lock
//! spread over N independent stores with no coordination between them.
//! A lock is held when a majority of stores accepted the caller's token
//! and enough of the TTL is left after accounting for the time the
//! round took and for clock drift.
//!
//! # Guarantees
//!
//! At most one client observes a valid lock at any instant, with high
//! probability, as long as a majority of stores is reachable and no
//! client keeps using a lock after its locally computed validity has
//! run out. A client that pauses past its validity, or a store whose
//! clock jumps, can still break mutual exclusion. Redlock has no
//! fencing and does not try to hide that.
//!
//! # Features
//!
//! - Quorum acquisition with parallel, per-store timeouts
//! - Drift-aware validity estimation
//! - Token-guarded release and extension via server-side scripts
//! - Jittered retries with rollback of partially acquired locks
//! - Cancellable acquisition and scoped `with_lock`
//! - Several resources locked together under one token
//!
//! # Example
//!
//! ```rust,no_run
//! use redlock::{LockManager, RedlockConfig};
//!
//! # async fn run() -> redlock::Result<()> {
//! let config = RedlockConfig::with_stores([
//!     "redis://127.0.0.1:6379/",
//!     "redis://127.0.0.1:6389/",
//!     "redis://127.0.0.1:6399/",
//! ]);
//! let locks = LockManager::from_config(&config)?;
//!
//! match locks.acquire("orders:42", 10_000).await {
//!     Ok(handle) => {
//!         // critical section
//!         locks.release(&handle).await;
//!     }
//!     Err(e) if e.is_not_acquired() => println!("busy: {}", e),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod quorum;
pub mod store;
pub mod timing;

pub use config::RedlockConfig;
pub use error::{AttemptFailure, Error, Result};
pub use lock::{LockHandle, LockManager};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LockConfig, RedlockConfig};
    pub use crate::error::{AttemptFailure, Error, Result};
    pub use crate::lock::{LockHandle, LockManager};
    pub use crate::store::{LockStore, MemoryStore, RedisStore};
    pub use crate::timing::TimingPolicy;
}
