//! Bounded cache of query results.
//!
//! Keeps the last server result of recently used queries so a resubscribe
//! (or a restart, via persistence) can answer synchronously. Eviction is
//! least-recently-used and never removes a query that is currently
//! subscribed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tessel_sync_types::{QueryHash, Triple, TxId};

/// Default number of cached queries.
pub const DEFAULT_QUERY_CACHE_LIMIT: usize = 10;

/// A cached query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedQuery {
    /// Query tree.
    pub q: Value,
    /// Server triples.
    pub triples: Vec<Triple>,
    /// Server tx-id of the result.
    pub processed_tx_id: TxId,
}

/// LRU index over cached results.
#[derive(Debug, Clone)]
pub struct QueryCache {
    limit: usize,
    tick: u64,
    entries: HashMap<QueryHash, (CachedQuery, u64)>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_CACHE_LIMIT)
    }
}

impl QueryCache {
    /// Create a cache holding up to `limit` inactive entries.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    /// Insert or refresh an entry.
    pub fn put(&mut self, hash: QueryHash, entry: CachedQuery) {
        self.tick += 1;
        self.entries.insert(hash, (entry, self.tick));
    }

    /// Look up an entry, marking it recently used.
    pub fn get(&mut self, hash: &QueryHash) -> Option<&CachedQuery> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(hash).map(|(entry, used)| {
            *used = tick;
            &*entry
        })
    }

    /// Look up without touching recency.
    pub fn peek(&self, hash: &QueryHash) -> Option<&CachedQuery> {
        self.entries.get(hash).map(|(entry, _)| entry)
    }

    /// Drop least-recently-used entries above the limit, skipping `active`.
    /// Returns the evicted hashes.
    pub fn evict(&mut self, active: &HashSet<QueryHash>) -> Vec<QueryHash> {
        let inactive = self
            .entries
            .keys()
            .filter(|h| !active.contains(*h))
            .count();
        if inactive <= self.limit {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, QueryHash)> = self
            .entries
            .iter()
            .filter(|(h, _)| !active.contains(*h))
            .map(|(h, (_, used))| (*used, h.clone()))
            .collect();
        candidates.sort();

        let excess = inactive - self.limit;
        let evicted: Vec<QueryHash> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, h)| h)
            .collect();
        for h in &evicted {
            self.entries.remove(h);
        }
        evicted
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
