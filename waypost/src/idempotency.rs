//! Response cache for retried requests.
//!
//! Callers opt in with an `Idempotency-Key` header or an `idempotencyKey`
//! RPC field. The first successful response is cached for [`IDEMPOTENCY_TTL_MS`]
//! and replayed verbatim for later requests carrying the same key on the
//! same operation. While the first request is still running, the key is
//! claimed and retries wait for its outcome instead of running again.
//! Expired entries are pruned on access; there is no timer.

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;

/// How long a cached response is replayed.
pub const IDEMPOTENCY_TTL_MS: u64 = 10 * 60 * 1000;

/// Upper bound on cached entries; the oldest is evicted past it.
pub const IDEMPOTENCY_MAX_ENTRIES: usize = 10_000;

/// A cached response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse {
    /// HTTP status of the original response.
    pub status: u16,
    /// Response body.
    pub body: serde_json::Value,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: u64,
    expires_at: u64,
    response: CachedResponse,
}

#[derive(Debug)]
enum Slot {
    Ready(CacheEntry),
    /// Claimed by a running request. The sender side is held by the
    /// claimant and dropped when it finishes or is cancelled.
    Pending(watch::Receiver<()>),
}

impl Slot {
    fn is_live(&self, now: u64) -> bool {
        match self {
            Self::Ready(entry) => entry.expires_at > now,
            Self::Pending(rx) => rx.has_changed().is_ok(),
        }
    }
}

/// Result of [`IdempotencyCache::claim`].
#[derive(Debug)]
pub enum Claim {
    /// A response is cached; replay it.
    Replay(CachedResponse),
    /// Another request holds the key. Wait on the receiver, then claim again.
    InFlight(watch::Receiver<()>),
    /// The caller owns the key. Run the operation, then [`IdempotencyCache::set`]
    /// or [`IdempotencyCache::release`], then drop the sender.
    Owner(watch::Sender<()>),
}

/// Key scoped to one operation, so equal client keys on different operations
/// never share a cached response.
#[must_use]
pub fn scoped_key(operation: &str, key: &str) -> String {
    format!("{operation}\u{1f}{key}")
}

/// Idempotency cache.
#[derive(Debug)]
pub struct IdempotencyCache {
    entries: HashMap<String, Slot>,
    ttl_ms: u64,
    max_entries: usize,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyCache {
    /// Create a cache with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(IDEMPOTENCY_TTL_MS)
    }

    /// Create a cache with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
            max_entries: IDEMPOTENCY_MAX_ENTRIES,
        }
    }

    /// Cached response for `key`, if still live at `now`.
    pub fn get(&mut self, key: &str, now: u64) -> Option<CachedResponse> {
        self.prune(now);
        match self.entries.get(key) {
            Some(Slot::Ready(entry)) => Some(entry.response.clone()),
            _ => None,
        }
    }

    /// Replay, wait or take ownership of `key`.
    ///
    /// A pending claim whose owner went away without finishing is taken over.
    pub fn claim(&mut self, key: &str, now: u64) -> Claim {
        self.prune(now);
        match self.entries.get(key) {
            Some(Slot::Ready(entry)) => return Claim::Replay(entry.response.clone()),
            Some(Slot::Pending(rx)) => return Claim::InFlight(rx.clone()),
            None => {}
        }
        let (tx, rx) = watch::channel(());
        self.entries.insert(key.to_string(), Slot::Pending(rx));
        Claim::Owner(tx)
    }

    /// Cache `response` under `key`, completing any claim on it.
    pub fn set(&mut self, key: &str, response: CachedResponse, now: u64) {
        self.prune(now);
        if self.entries.len() >= self.max_entries
            && !self.entries.contains_key(key)
            && let Some(oldest) = self
                .entries
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready(e) => Some((k, e.stored_at)),
                    Slot::Pending(_) => None,
                })
                .min_by_key(|(_, stored_at)| *stored_at)
                .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest);
        }
        self.entries.insert(
            key.to_string(),
            Slot::Ready(CacheEntry {
                stored_at: now,
                expires_at: now.saturating_add(self.ttl_ms),
                response,
            }),
        );
    }

    /// Drop a claim without caching anything, so the next caller runs.
    pub fn release(&mut self, key: &str) {
        if matches!(self.entries.get(key), Some(Slot::Pending(_))) {
            self.entries.remove(key);
        }
    }

    /// Drop expired entries and abandoned claims.
    pub fn prune(&mut self, now: u64) {
        self.entries.retain(|_, slot| slot.is_live(now));
    }

    /// Number of live-or-unpruned entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
