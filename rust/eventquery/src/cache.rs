//! Result cache
//!
//! Memoizes remote results keyed by the canonical form of a clamped query.
//! Entries are bounded by a short TTL because the store keeps ingesting,
//! and are replaced wholesale on every write.

use crate::{
    error::RemoteQueryError,
    models::{Aggregation, QueryParams, QueryResult, Scalar},
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a stored result stays servable (default: 5 seconds)
    pub ttl: Duration,

    /// Maximum number of cached entries (default: 10,000)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_entries: 10_000,
        }
    }
}

/// Canonical serialization of everything that affects a query's rows.
/// The referrer is left out since it only tags the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    dataset: &'a str,
    start: i64,
    end: i64,
    selected_columns: &'a [String],
    groupby: &'a [String],
    filter_keys: &'a BTreeMap<String, BTreeSet<Scalar>>,
    aggregations: &'a [Aggregation],
}

impl CacheKey {
    pub fn for_query(query: &QueryParams) -> Result<Self, RemoteQueryError> {
        let material = KeyMaterial {
            dataset: &query.dataset,
            start: query.start.timestamp_micros(),
            end: query.end.timestamp_micros(),
            selected_columns: &query.selected_columns,
            groupby: &query.groupby,
            filter_keys: &query.filter_keys,
            aggregations: &query.aggregations,
        };
        serde_json::to_string(&material)
            .map(CacheKey)
            .map_err(|err| RemoteQueryError::invalid(format!("failed to derive cache key: {err}")))
    }
}

struct CacheEntry {
    result: QueryResult,
    stored_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) <= ttl
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

pub struct ResultCache {
    config: CacheConfig,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    stats: CacheStats,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<QueryResult> {
        self.lookup_at(key, Instant::now())
    }

    pub(crate) fn lookup_at(&self, key: &CacheKey, now: Instant) -> Option<QueryResult> {
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_fresh(now, self.config.ttl) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            // A concurrent store may have refreshed it in between.
            if entries
                .get(key)
                .is_some_and(|entry| !entry.is_fresh(now, self.config.ttl))
            {
                entries.remove(key);
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(expired, "result cache miss");
        None
    }

    pub fn store(&self, key: CacheKey, result: QueryResult) {
        self.store_at(key, result, Instant::now());
    }

    pub(crate) fn store_at(&self, key: CacheKey, result: QueryResult, now: Instant) {
        let mut entries = self.entries.write();

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let ttl = self.config.ttl;
            entries.retain(|_, entry| entry.is_fresh(now, ttl));

            if entries.len() >= self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: now,
            },
        );
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
