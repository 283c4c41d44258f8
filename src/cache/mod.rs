//! Response caching.

mod response_cache;

pub use response_cache::{CacheHit, CacheKey, ResponseCache};
