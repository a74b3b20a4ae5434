//! Response caching.
//!
//! - [`RequestFingerprint`]: stable digest of everything that can change
//!   a request's output.
//! - [`CacheBackend`]: storage contract (`get`, `set` with ttl,
//!   `delete_pattern`); [`MemoryCache`] is the bundled moka-backed store.
//! - [`CacheGateway`]: lookup, store and single-flight resolution on top
//!   of a store. Lookup and store failures never fail a request.

pub mod fingerprint;
pub mod gateway;
pub mod store;

pub use fingerprint::RequestFingerprint;
pub use gateway::{CacheGateway, CacheStats, Resolution};
pub use store::{CacheBackend, CacheEntry, MemoryCache, glob_match};
