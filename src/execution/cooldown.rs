//! Per-ticker cooldowns to prevent overtrading.
//!
//! A ticker enters cooldown after any exit and after repeated broker rejects.
//! Re-adding only ever extends the window; an earlier expiry than the active
//! one is a no-op.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// An active trading prohibition for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cooldown {
    pub ticker: String,
    pub until: DateTime<Utc>,
    pub reason: String,
    pub source: String,
}

/// Tracks cooldown windows per ticker. Expired entries are pruned on read.
#[derive(Debug, Default)]
pub struct CooldownManager {
    cooldowns: HashMap<String, Cooldown>,
}

impl CooldownManager {
    pub const DEFAULT_DURATION_HOURS: i64 = 3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Add or extend a cooldown. Extend-only: if the ticker already has a
    /// later `until`, the call is a no-op.
    pub fn add(&mut self, ticker: &str, duration: Duration, reason: &str, source: &str) {
        let until = Utc::now() + duration;
        self.add_until(ticker, until, reason, source);
    }

    /// As [`CooldownManager::add`] with an explicit expiry instant.
    pub fn add_until(&mut self, ticker: &str, until: DateTime<Utc>, reason: &str, source: &str) {
        match self.cooldowns.get(ticker) {
            Some(existing) if existing.until >= until => {
                debug!(ticker, existing = %existing.until, "cooldown already covers window");
            }
            _ => {
                debug!(ticker, %until, reason, "cooldown set");
                self.cooldowns.insert(
                    ticker.to_string(),
                    Cooldown {
                        ticker: ticker.to_string(),
                        until,
                        reason: reason.to_string(),
                        source: source.to_string(),
                    },
                );
            }
        }
    }

    /// Whether an unexpired cooldown exists for the ticker.
    pub fn contains(&self, ticker: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(ticker)
            .is_some_and(|c| c.until > now)
    }

    /// Remaining cooldown time, zero when absent or expired.
    pub fn remaining(&self, ticker: &str, now: DateTime<Utc>) -> Duration {
        self.cooldowns
            .get(ticker)
            .map(|c| (c.until - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    /// Tickers with unexpired cooldowns.
    pub fn all_active(&self, now: DateTime<Utc>) -> HashSet<String> {
        self.cooldowns
            .values()
            .filter(|c| c.until > now)
            .map(|c| c.ticker.clone())
            .collect()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.cooldowns.len();
        self.cooldowns.retain(|_, c| c.until > now);
        before - self.cooldowns.len()
    }

    /// Remove a cooldown outright. Safe when absent.
    pub fn remove(&mut self, ticker: &str) {
        self.cooldowns.remove(ticker);
    }

    pub fn len(&self) -> usize {
        self.cooldowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cooldowns.is_empty()
    }

    /// All entries, for persistence.
    pub fn snapshot(&self) -> Vec<Cooldown> {
        let mut entries: Vec<_> = self.cooldowns.values().cloned().collect();
        entries.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        entries
    }

    /// Rebuild from a persisted snapshot.
    pub fn restore(&mut self, entries: Vec<Cooldown>) {
        self.cooldowns = entries
            .into_iter()
            .map(|c| (c.ticker.clone(), c))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_until_expiry() {
        let mut cooldowns = CooldownManager::new();
        let now = Utc::now();
        cooldowns.add("AAPL", Duration::hours(3), "exit", "engine");

        assert!(cooldowns.contains("AAPL", now));
        assert!(!cooldowns.contains("AAPL", now + Duration::hours(4)));
        assert!(!cooldowns.contains("MSFT", now));
    }

    #[test]
    fn test_extend_only_semantics() {
        let mut cooldowns = CooldownManager::new();
        let now = Utc::now();

        cooldowns.add_until("AAPL", now + Duration::hours(3), "exit", "engine");
        // Earlier expiry is a no-op.
        cooldowns.add_until("AAPL", now + Duration::hours(1), "reject", "engine");
        assert!(cooldowns.contains("AAPL", now + Duration::hours(2)));

        // Later expiry extends.
        cooldowns.add_until("AAPL", now + Duration::hours(6), "reject", "engine");
        assert!(cooldowns.contains("AAPL", now + Duration::hours(5)));
    }

    #[test]
    fn test_prune_drops_expired_only() {
        let mut cooldowns = CooldownManager::new();
        let now = Utc::now();
        cooldowns.add_until("GONE", now - Duration::minutes(1), "exit", "engine");
        cooldowns.add_until("KEPT", now + Duration::hours(1), "exit", "engine");

        assert_eq!(cooldowns.prune(now), 1);
        assert_eq!(cooldowns.len(), 1);
        assert!(cooldowns.contains("KEPT", now));
    }

    #[test]
    fn test_all_active_excludes_expired() {
        let mut cooldowns = CooldownManager::new();
        let now = Utc::now();
        cooldowns.add_until("LIVE", now + Duration::hours(1), "exit", "engine");
        cooldowns.add_until("DEAD", now - Duration::hours(1), "exit", "engine");

        let active = cooldowns.all_active(now);
        assert!(active.contains("LIVE"));
        assert!(!active.contains("DEAD"));
    }

    #[test]
    fn test_remaining_clamped_to_zero() {
        let mut cooldowns = CooldownManager::new();
        let now = Utc::now();
        cooldowns.add_until("AAPL", now + Duration::minutes(30), "exit", "engine");

        assert_eq!(cooldowns.remaining("AAPL", now), Duration::minutes(30));
        assert_eq!(
            cooldowns.remaining("AAPL", now + Duration::hours(1)),
            Duration::zero()
        );
        assert_eq!(cooldowns.remaining("NONE", now), Duration::zero());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut cooldowns = CooldownManager::new();
        let now = Utc::now();
        cooldowns.add_until("AAPL", now + Duration::hours(2), "exit", "engine");
        cooldowns.add_until("TSLA", now + Duration::hours(1), "rejects", "engine");

        let snapshot = cooldowns.snapshot();
        let mut restored = CooldownManager::new();
        restored.restore(snapshot.clone());

        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.contains("AAPL", now));
        assert!(restored.contains("TSLA", now));
    }
}
