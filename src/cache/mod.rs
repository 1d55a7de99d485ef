use crate::models::{MarketSnapshot, Timeframe};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CacheKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

struct Entry {
    snapshot: Arc<MarketSnapshot>,
    inserted_at: Instant,
}

/// Bounded in-memory store of recent market snapshots
///
/// Eviction is by insertion order, not recency of use: once the bound is
/// exceeded the oldest-inserted entries go first. Independently of the bound,
/// no entry is served or kept past `max_age`.
///
/// Not synchronised on its own; the orchestrator context wraps it in a mutex
/// shared with the health controller.
pub struct MarketDataCache {
    entries: HashMap<CacheKey, Entry>,
    order: VecDeque<CacheKey>,
    max_entries: usize,
    max_age: Duration,
}

impl MarketDataCache {
    /// Create a new cache
    ///
    /// # Arguments
    /// * `max_entries` - Upper bound on stored snapshots (clamped to at least 1)
    /// * `max_age` - Hard expiry for every entry
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            max_age,
        }
    }

    /// Look up a snapshot no older than `max_age` (and never older than the
    /// cache-wide max age)
    pub fn get(&self, key: &CacheKey, max_age: Duration) -> Option<Arc<MarketSnapshot>> {
        let limit = max_age.min(self.max_age);
        self.entries
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() <= limit)
            .map(|entry| entry.snapshot.clone())
    }

    /// Store a snapshot, replacing any previous one for the key
    ///
    /// A replacement counts as a fresh insertion for eviction order.
    pub fn put(&mut self, key: CacheKey, snapshot: MarketSnapshot) {
        self.purge_expired();

        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }

        self.entries.insert(
            key.clone(),
            Entry {
                snapshot: Arc::new(snapshot),
                inserted_at: Instant::now(),
            },
        );
        self.order.push_back(key);

        self.enforce_bound();
    }

    /// Drop entries past the cache-wide max age; returns how many went
    pub fn purge_expired(&mut self) -> usize {
        let max_age = self.max_age;
        let before = self.entries.len();

        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= max_age);
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));

        before - self.entries.len()
    }

    /// Evict oldest-inserted entries until within bound; returns how many went
    pub fn enforce_bound(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bound(&self) -> usize {
        self.max_entries
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
