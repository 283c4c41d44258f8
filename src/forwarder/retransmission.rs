//! Client retransmission detection.
//!
//! A client that repeats the same query from the same endpoint within a
//! short window has probably not heard back from us because the primary
//! upstreams are unreachable; the forwarder answers such retransmissions
//! through the fallback upstreams directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock;

/// Tracks recently seen `(endpoint, query id, question)` triples.
pub struct RetransmissionDetector {
    window: Duration,
    seen: Mutex<HashMap<(SocketAddr, u16, String), Instant>>,
}

impl RetransmissionDetector {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a query and report whether it repeats one seen within the
    /// window. Stale entries are pruned on the way.
    pub fn register(&self, peer: SocketAddr, id: u16, question: &str) -> bool {
        let now = clock::now();
        let mut seen = self.seen.lock();

        seen.retain(|_, last| now.duration_since(*last) <= self.window);

        match seen.insert((peer, id, question.to_string()), now) {
            Some(previous) => now.duration_since(previous) <= self.window,
            None => false,
        }
    }
}
