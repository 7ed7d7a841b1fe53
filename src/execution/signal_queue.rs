//! Priority queue for pending trade proposals.
//!
//! Ordering is strictly by `priority` ascending (lower = earlier), ties broken
//! by `created_at` then insertion sequence, so equal-priority signals drain
//! FIFO. At most one queued signal per ticker at any time; overflow rejects
//! the incoming signal rather than evicting a queued one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use tracing::debug;

use crate::domain::{validate_ticker, AgentRecommendation, TradeAction};

/// A trade proposal waiting to be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSignal {
    pub ticker: String,
    pub action: TradeAction,
    /// Lower value = served earlier.
    pub priority: i32,
    /// 0-100.
    pub confidence: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub agent_recommendation: Option<AgentRecommendation>,
}

impl PendingSignal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }

    /// Structural validation applied at admission.
    fn admission_error(&self) -> Option<String> {
        if validate_ticker(&self.ticker).is_err() {
            return Some(format!("invalid ticker '{}'", self.ticker));
        }
        if !(0.0..=100.0).contains(&self.confidence) {
            return Some(format!("confidence {} out of range", self.confidence));
        }
        if let Some(expires) = self.expires_at {
            if expires <= self.created_at {
                return Some("expires_at must be after created_at".to_string());
            }
        }
        None
    }
}

/// Why a signal was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DuplicateTicker,
    Capacity,
    Expired,
    Invalid(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DuplicateTicker => f.write_str("duplicate_ticker"),
            RejectReason::Capacity => f.write_str("capacity"),
            RejectReason::Expired => f.write_str("expired"),
            RejectReason::Invalid(detail) => write!(f, "invalid: {detail}"),
        }
    }
}

/// Outcome of `SignalQueue::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Heap entry: reversed ordering so the `BinaryHeap` max is our minimum.
#[derive(Debug)]
struct QueuedSignal {
    signal: PendingSignal,
    sequence: u64,
}

impl PartialEq for QueuedSignal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedSignal {}

impl PartialOrd for QueuedSignal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSignal {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.signal.priority.cmp(&self.signal.priority) {
            Ordering::Equal => match other.signal.created_at.cmp(&self.signal.created_at) {
                Ordering::Equal => other.sequence.cmp(&self.sequence),
                ord => ord,
            },
            ord => ord,
        }
    }
}

/// Bounded, deduplicated priority queue of pending signals.
pub struct SignalQueue {
    heap: BinaryHeap<QueuedSignal>,
    tickers: HashSet<String>,
    sequence: u64,
    max_signals: usize,
    default_ttl: Duration,
}

impl SignalQueue {
    pub const DEFAULT_MAX_SIGNALS: usize = 100;
    pub const DEFAULT_TTL_HOURS: i64 = 4;

    pub fn new(max_signals: usize, default_ttl: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            tickers: HashSet::new(),
            sequence: 0,
            max_signals,
            default_ttl,
        }
    }

    /// Admit a signal. Assigns the default TTL when `expires_at` is unset.
    pub fn add(&mut self, mut signal: PendingSignal) -> Admission {
        if let Some(detail) = signal.admission_error() {
            return Admission::Rejected(RejectReason::Invalid(detail));
        }
        if self.tickers.contains(&signal.ticker) {
            return Admission::Rejected(RejectReason::DuplicateTicker);
        }
        if self.heap.len() >= self.max_signals {
            return Admission::Rejected(RejectReason::Capacity);
        }
        if signal.is_expired(Utc::now()) {
            return Admission::Rejected(RejectReason::Expired);
        }

        if signal.expires_at.is_none() {
            signal.expires_at = Some(signal.created_at + self.default_ttl);
        }

        debug!(
            ticker = %signal.ticker,
            priority = signal.priority,
            source = %signal.source,
            "signal enqueued"
        );

        self.tickers.insert(signal.ticker.clone());
        let sequence = self.sequence;
        self.sequence += 1;
        self.heap.push(QueuedSignal { signal, sequence });

        Admission::Accepted
    }

    /// Pop up to `limit` non-expired signals in priority order. Expired
    /// entries encountered on the way are dropped silently; call
    /// [`SignalQueue::take_expired`] first if expiry events are wanted.
    pub fn pop_ready(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<PendingSignal> {
        let mut ready = Vec::with_capacity(limit.min(self.heap.len()));
        while ready.len() < limit {
            let Some(entry) = self.heap.pop() else { break };
            self.tickers.remove(&entry.signal.ticker);
            if entry.signal.is_expired(now) {
                continue;
            }
            ready.push(entry.signal);
        }
        ready
    }

    /// Highest-priority entry, without removal.
    pub fn peek(&self) -> Option<&PendingSignal> {
        self.heap.peek().map(|entry| &entry.signal)
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.contains(ticker)
    }

    /// Remove the queued signal for `ticker`, if any.
    pub fn remove(&mut self, ticker: &str) -> bool {
        if !self.tickers.remove(ticker) {
            return false;
        }
        let entries: Vec<_> = std::mem::take(&mut self.heap).into_vec();
        for entry in entries {
            if entry.signal.ticker != ticker {
                self.heap.push(entry);
            }
        }
        true
    }

    /// Remove and return all expired signals.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<PendingSignal> {
        let entries: Vec<_> = std::mem::take(&mut self.heap).into_vec();
        let mut expired = Vec::new();
        for entry in entries {
            if entry.signal.is_expired(now) {
                self.tickers.remove(&entry.signal.ticker);
                expired.push(entry.signal);
            } else {
                self.heap.push(entry);
            }
        }
        expired
    }

    /// Drop expired signals, returning how many were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.take_expired(now).len()
    }

    /// Queue contents in priority order, for persistence.
    pub fn snapshot(&self) -> Vec<PendingSignal> {
        let mut entries: Vec<_> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.signal.clone()).collect()
    }

    /// Rebuild the queue from a persisted snapshot. Entries beyond capacity
    /// or with duplicate tickers are dropped.
    pub fn restore(&mut self, signals: Vec<PendingSignal>) {
        self.heap.clear();
        self.tickers.clear();
        for signal in signals {
            if self.heap.len() >= self.max_signals || self.tickers.contains(&signal.ticker) {
                continue;
            }
            self.tickers.insert(signal.ticker.clone());
            let sequence = self.sequence;
            self.sequence += 1;
            self.heap.push(QueuedSignal { signal, sequence });
        }
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_SIGNALS,
            Duration::hours(Self::DEFAULT_TTL_HOURS),
        )
    }
}
