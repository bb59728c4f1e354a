//! Lock handle returned to callers

use std::time::{Duration, Instant};

/// An acquired lock.
///
/// The handle carries no connection to the stores. Release and extend
/// take it by reference and run a full quorum round with its resource
/// and token. Nothing stops a caller from using a handle past its
/// validity; check [`LockHandle::is_expired`] before relying on it.
///
/// Two handles are equal when they name the same lock: same resources and
/// token. Validity is not compared, so a handle equals its extension.
#[derive(Debug, Clone)]
pub struct LockHandle {
    resources: Vec<String>,
    token: String,
    validity: Duration,
    acquired_at: Instant,
}

impl LockHandle {
    pub(crate) fn new(resources: Vec<String>, token: String, validity_ms: f64) -> Self {
        Self {
            resources,
            token,
            validity: Duration::from_secs_f64(validity_ms.max(0.0) / 1000.0),
            acquired_at: Instant::now(),
        }
    }

    /// Locked resource name. For a handle over several resources, the first.
    pub fn resource(&self) -> &str {
        self.resources.first().map(String::as_str).unwrap_or_default()
    }

    /// Every resource held under this handle's token
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Ownership token written to the stores
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Validity estimated when the lock was acquired or last extended
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Validity in whole milliseconds
    pub fn validity_ms(&self) -> u64 {
        self.validity.as_millis() as u64
    }

    /// Validity left now, measured on the local monotonic clock
    pub fn remaining(&self) -> Duration {
        self.validity.saturating_sub(self.acquired_at.elapsed())
    }

    /// Whether the locally estimated validity has run out
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

impl PartialEq for LockHandle {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token && self.resources == other.resources
    }
}

impl Eq for LockHandle {}

impl std::fmt::Display for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] valid for {}ms",
            self.resources.join(","),
            self.token,
            self.remaining().as_millis()
        )
    }
}
