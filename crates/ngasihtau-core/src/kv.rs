//! Atomic key-value port backing rate limits, replay nonces, and blocks.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Result;

/// Atomic counter / flag store with TTL semantics.
///
/// All contention is handled by the store: `incr` and `setnx` are atomic with
/// respect to concurrent callers.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Atomically increments a counter, installing `ttl` when the key is
    /// created. `Duration::ZERO` means no expiry. Returns the post-increment
    /// value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Reads a live value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// SET IF NOT EXISTS with expiry. Returns true when this call created
    /// the key; false when a live key already existed.
    async fn setnx(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Deletes a key.
    async fn del(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at_ms: Option<u64>,
}

/// In-memory [`Kv`] with an advanceable clock for window-expiry tests.
pub struct InMemoryKv {
    entries: DashMap<String, Entry>,
    epoch: Instant,
    clock_offset_ms: AtomicU64,
}

impl InMemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            clock_offset_ms: AtomicU64::new(0),
        }
    }

    /// Moves the store's clock forward, expiring entries whose TTL elapses.
    pub fn advance(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of keys, expired entries included until touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no keys exist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + self.clock_offset_ms.load(Ordering::SeqCst)
    }

    fn is_live(&self, entry: &Entry, now_ms: u64) -> bool {
        entry.expires_at_ms.map(|t| now_ms < t).unwrap_or(true)
    }

    fn expiry(&self, ttl: Duration, now_ms: u64) -> Option<u64> {
        if ttl.is_zero() {
            None
        } else {
            Some(now_ms + ttl.as_millis() as u64)
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kv for InMemoryKv {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now_ms = self.now_ms();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at_ms: self.expiry(ttl, now_ms),
        });
        if !self.is_live(&entry, now_ms) {
            // Window elapsed: the key restarts fresh with a new TTL.
            *entry = Entry {
                value: 0,
                expires_at_ms: self.expiry(ttl, now_ms),
            };
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now_ms = self.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| self.is_live(entry, now_ms))
            .map(|entry| entry.value))
    }

    async fn setnx(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now_ms = self.now_ms();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if self.is_live(occupied.get(), now_ms) {
                    Ok(false)
                } else {
                    occupied.insert(Entry {
                        value: 1,
                        expires_at_ms: self.expiry(ttl, now_ms),
                    });
                    Ok(true)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: 1,
                    expires_at_ms: self.expiry(ttl, now_ms),
                });
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
