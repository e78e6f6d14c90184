//! Response caching.
//!
//! - [`ResponseCache`]: exact and semantic (near-duplicate) lookups over the
//!   shared [`StateStore`](crate::store::StateStore), namespaced per tenant.
//! - [`CachePolicy`]: decides whether a prompt may be cached and for how
//!   long, before any cache write.

pub mod policy;
pub mod response;

pub use policy::{CacheDecision, CachePolicy, CacheTtl};
pub use response::{CacheConfig, CacheStats, CachedResponse, CachedTokenUsage, ResponseCache};

use sha2::{Digest, Sha256};

/// Stable content hash (SHA-256, lowercase hex), identical across processes.
pub(crate) fn content_hash(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
