//! TTL response caches.
//!
//! Two instances exist at runtime, both storing whole wire-format DNS
//! responses keyed by string:
//! - the decision cache (`<group>:<qtype>:<qname>`) memoizes synthesized
//!   block/rewrite answers for 20 s,
//! - the upstream cache (`<qtype>:<qname>`) memoizes forwarded answers
//!   for the response's own minimum record TTL, clamped by the server.
//!
//! Entries past their expiry are invisible to `get` immediately; a
//! background sweeper reclaims the memory once a minute. `get` hands out
//! an owned copy with the message ID patched to the caller's request, so
//! cached bytes are never mutated in place.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::shutdown::Shutdown;

#[derive(Debug)]
struct CacheEntry {
    response: Vec<u8>,
    expires_at: OffsetDateTime,
}

/// A string-keyed TTL map for wire-format DNS responses.
#[derive(Debug, Default)]
pub struct TtlCache {
    items: RwLock<HashMap<String, CacheEntry>>,
}

/// How often the sweeper reclaims expired entries.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a response under `key` for `ttl`.
    pub fn put(&self, key: String, response: &[u8], ttl: Duration) {
        let entry = CacheEntry {
            response: response.to_vec(),
            expires_at: OffsetDateTime::now_utc() + ttl,
        };
        self.items.write().unwrap().insert(key, entry);
    }

    /// Fetch a fresh response copy with its message ID rewritten to
    /// `request_id`. Expired entries return `None` (the sweeper removes
    /// them later).
    pub fn get(&self, key: &str, request_id: u16) -> Option<Vec<u8>> {
        let items = self.items.read().unwrap();
        let entry = items.get(key)?;
        if entry.expires_at <= OffsetDateTime::now_utc() {
            return None;
        }
        let mut response = entry.response.clone();
        drop(items);

        // The message ID is the first two bytes of the wire format.
        if response.len() >= 2 {
            response[..2].copy_from_slice(&request_id.to_be_bytes());
        }
        Some(response)
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let now = OffsetDateTime::now_utc();
        let mut items = self.items.write().unwrap();
        let before = items.len();
        items.retain(|_, entry| entry.expires_at > now);
        let dropped = before - items.len();
        if dropped > 0 {
            debug!(dropped, remaining = items.len(), "swept expired cache entries");
        }
    }

    /// Start the once-a-minute sweeper; it stops with the shutdown signal.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: Shutdown) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tick.tick() => cache.sweep(),
                }
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }
}
