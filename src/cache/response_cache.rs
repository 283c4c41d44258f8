//! Bounded LRU cache for upstream responses.
//!
//! Entries expire after the minimum TTL across the response's answer records.
//! With the optimistic mode enabled an expired entry is still served once,
//! with every TTL clamped to one second, while the caller refreshes it in the
//! background.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use lru::LruCache;
use parking_lot::RwLock;

use crate::clock;

/// Cache key: the normalized question plus the flag pair that changes what
/// an upstream would answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Question name, lowercased, without the trailing dot.
    name: String,
    qtype: u16,
    qclass: u16,
    checking_disabled: bool,
    dnssec_ok: bool,
}

impl CacheKey {
    /// Build the key from a request message. `None` when the request has no
    /// question.
    #[must_use]
    pub fn from_request(request: &Message) -> Option<Self> {
        let question = request.queries().first()?;
        let name = question
            .name()
            .to_utf8()
            .trim_end_matches('.')
            .to_lowercase();
        Some(Self {
            name,
            qtype: question.query_type().into(),
            qclass: question.query_class().into(),
            checking_disabled: request.checking_disabled(),
            dnssec_ok: request
                .extensions()
                .as_ref()
                .map_or(false, |edns| edns.dnssec_ok()),
        })
    }
}

struct CachedResponse {
    response: Message,
    cached_at: Instant,
    expires_at: Instant,
    upstream_id: Option<i32>,
}

/// A response served from the cache.
pub struct CacheHit {
    pub response: Message,
    pub upstream_id: Option<i32>,
    /// True when the entry was past its TTL and served optimistically.
    pub expired: bool,
}

/// Shared response cache with a readers-writer discipline: lookups promote
/// recency, so every access to the LRU order is writer-exclusive, and
/// readers never observe a partially updated entry.
pub struct ResponseCache {
    inner: Option<RwLock<LruCache<CacheKey, CachedResponse>>>,
    optimistic: bool,
}

impl ResponseCache {
    /// A cache holding at most `size` entries. A zero size disables caching.
    #[must_use]
    pub fn new(size: usize, optimistic: bool) -> Self {
        Self {
            inner: NonZeroUsize::new(size).map(|size| RwLock::new(LruCache::new(size))),
            optimistic,
        }
    }

    /// Look up a response. TTLs are decayed by the time spent in the cache;
    /// an expired entry is dropped, or served with TTLs of one second when
    /// the optimistic mode is on.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let inner = self.inner.as_ref()?;
        let now = clock::now();

        let mut cache = inner.write();
        let entry = cache.get(key)?;

        if now < entry.expires_at {
            let elapsed = now.duration_since(entry.cached_at).as_secs() as u32;
            let mut response = entry.response.clone();
            adjust_ttls(&mut response, |ttl| ttl.saturating_sub(elapsed));
            return Some(CacheHit {
                response,
                upstream_id: entry.upstream_id,
                expired: false,
            });
        }

        if self.optimistic {
            let mut response = entry.response.clone();
            adjust_ttls(&mut response, |_| 1);
            return Some(CacheHit {
                response,
                upstream_id: entry.upstream_id,
                expired: true,
            });
        }

        cache.pop(key);
        None
    }

    /// Insert a response. Responses without any TTL-bearing record are not
    /// cached.
    pub fn insert(&self, key: CacheKey, response: Message, upstream_id: Option<i32>) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let Some(ttl) = min_ttl(&response) else {
            return;
        };

        let now = clock::now();
        inner.write().put(
            key,
            CachedResponse {
                response,
                cached_at: now,
                expires_at: now + Duration::from_secs(u64::from(ttl)),
                upstream_id,
            },
        );
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.read().len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Minimum TTL across answer records, falling back to the authority section
/// for negative responses.
fn min_ttl(response: &Message) -> Option<u32> {
    let answers = response.answers().iter().map(hickory_proto::rr::Record::ttl);
    match answers.min() {
        Some(ttl) => Some(ttl),
        None => response
            .name_servers()
            .iter()
            .map(hickory_proto::rr::Record::ttl)
            .min(),
    }
}

/// Rewrite the TTL of every answer and authority record. OPT pseudo-records
/// keep their TTL field: it encodes EDNS flags, not a lifetime.
fn adjust_ttls(response: &mut Message, adjust: impl Fn(u32) -> u32) {
    let mut answers = response.take_answers();
    for record in &mut answers {
        record.set_ttl(adjust(record.ttl()));
    }
    response.insert_answers(answers);

    let mut authority = response.take_name_servers();
    for record in &mut authority {
        if record.record_type() != RecordType::OPT {
            record.set_ttl(adjust(record.ttl()));
        }
    }
    response.insert_name_servers(authority);
}
