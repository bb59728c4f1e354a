//! Lock Module
//!
//! The Redlock algorithm: quorum acquisition with drift-aware validity,
//! token-guarded release and extension, and jittered retries.

mod handle;
mod manager;
mod token;

pub use handle::LockHandle;
pub use manager::LockManager;
pub use token::{generate_token, TOKEN_BYTES};
