//! Per-ticker TTL cache for technical snapshots.
//!
//! Bounds signal-provider calls to at most one per ticker per cycle. The
//! engine clears the cache at every cycle start; the TTL still guards against
//! staleness inside a long cycle.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::domain::TechnicalSignals;

#[derive(Debug, Clone)]
struct CachedSignal {
    signal: TechnicalSignals,
    fetched_at: DateTime<Utc>,
    ttl: Duration,
}

#[derive(Debug)]
pub struct SignalCache {
    entries: HashMap<String, CachedSignal>,
    default_ttl: Duration,
    hits: u64,
    misses: u64,
}

impl SignalCache {
    pub const DEFAULT_TTL_SECS: i64 = 300;

    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
            hits: 0,
            misses: 0,
        }
    }

    /// Fresh snapshot for `ticker`, if one is cached.
    pub fn get(&mut self, ticker: &str, now: DateTime<Utc>) -> Option<TechnicalSignals> {
        match self.entries.get(ticker) {
            Some(cached) if now - cached.fetched_at <= cached.ttl => {
                self.hits += 1;
                Some(cached.signal.clone())
            }
            Some(_) => {
                self.entries.remove(ticker);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a snapshot with the default TTL.
    pub fn insert(&mut self, signal: TechnicalSignals, now: DateTime<Utc>) {
        self.insert_with_ttl(signal, now, self.default_ttl);
    }

    pub fn insert_with_ttl(&mut self, signal: TechnicalSignals, now: DateTime<Utc>, ttl: Duration) {
        self.entries.insert(
            signal.symbol.clone(),
            CachedSignal {
                signal,
                fetched_at: now,
                ttl,
            },
        );
    }

    /// Drop stale entries, returning how many were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, c| now - c.fetched_at <= c.ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
