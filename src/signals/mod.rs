//! Signal and market-data provider seams.
//!
//! Technical indicator computation lives upstream; the engine only consumes a
//! per-ticker [`TechnicalSignals`] snapshot and a recent VIX reading. Both are
//! behind traits so tests and the paper setup can supply canned data.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::TechnicalSignals;
use crate::error::{Result, TradewindError};

/// Produces technical snapshots for tickers, with bounded latency.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn fetch_signals(&self, ticker: &str) -> Result<TechnicalSignals>;
}

/// Supplies broader market context. `None` from `vix()` is tolerated; the
/// engine substitutes a neutral sentinel and continues.
pub trait MarketDataProvider: Send + Sync {
    fn vix(&self) -> Option<f64>;
}

/// Fixed VIX value (or none at all). Used by the paper setup and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMarketData {
    pub vix: Option<f64>,
}

impl MarketDataProvider for StaticMarketData {
    fn vix(&self) -> Option<f64> {
        self.vix
    }
}

/// Canned per-ticker snapshots. Unknown tickers return `SignalsUnavailable`.
#[derive(Default)]
pub struct StaticSignalProvider {
    snapshots: Mutex<HashMap<String, TechnicalSignals>>,
}

impl StaticSignalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, signals: TechnicalSignals) {
        self.snapshots
            .lock()
            .expect("snapshot lock")
            .insert(signals.symbol.clone(), signals);
    }

    pub fn remove(&self, ticker: &str) {
        self.snapshots.lock().expect("snapshot lock").remove(ticker);
    }
}

#[async_trait]
impl SignalProvider for StaticSignalProvider {
    async fn fetch_signals(&self, ticker: &str) -> Result<TechnicalSignals> {
        self.snapshots
            .lock()
            .expect("snapshot lock")
            .get(ticker)
            .cloned()
            .ok_or_else(|| TradewindError::SignalsUnavailable(ticker.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_provider_lookup() {
        let provider = StaticSignalProvider::new();
        provider.insert(TechnicalSignals {
            symbol: "AAPL".to_string(),
            price: dec!(150),
            atr: dec!(2.5),
            momentum: 5.0,
            score: 0.75,
            rsi: 55.0,
            signals: vec![],
            bars: vec![],
        });

        let snapshot = provider.fetch_signals("AAPL").await.unwrap();
        assert_eq!(snapshot.price, dec!(150));

        let missing = provider.fetch_signals("MSFT").await.unwrap_err();
        assert!(matches!(missing, TradewindError::SignalsUnavailable(_)));
    }
}
