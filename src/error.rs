use thiserror::Error;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum TradewindError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Validation errors - caller's fault, never retried
    #[error("Invalid order params: {0}")]
    InvalidOrderParams(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    // Broker errors
    #[error("Transient broker error: {0}")]
    BrokerTransient(String),

    #[error("Broker rejected order for {ticker}: {reason}")]
    BrokerRejected { ticker: String, reason: String },

    #[error("Broker call timed out after {elapsed_ms}ms")]
    BrokerTimeout { elapsed_ms: u64 },

    // Data errors - degrade gracefully
    #[error("Signals unavailable for {0}")]
    SignalsUnavailable(String),

    #[error("Stale data: {0}")]
    StaleData(String),

    // Persistence errors
    #[error("State persistence failed: {0}")]
    Persistence(String),

    #[error("State file corrupt: {0}")]
    StateCorrupt(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal invariant violations - fail fast, abort the cycle
    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TradewindError {
    /// Whether a broker error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TradewindError::BrokerTransient(_) | TradewindError::BrokerTimeout { .. }
        )
    }

    /// Validation errors surface synchronously to the caller and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TradewindError::InvalidOrderParams(_)
                | TradewindError::InvalidSignal(_)
                | TradewindError::UnknownStrategy(_)
        )
    }
}

/// Result type alias for TradewindError
pub type Result<T> = std::result::Result<T, TradewindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TradewindError::BrokerTransient("503".into()).is_transient());
        assert!(TradewindError::BrokerTimeout { elapsed_ms: 30_000 }.is_transient());
        assert!(!TradewindError::BrokerRejected {
            ticker: "AAPL".into(),
            reason: "insufficient funds".into()
        }
        .is_transient());
    }

    #[test]
    fn test_validation_classification() {
        assert!(TradewindError::InvalidOrderParams("stop above entry".into()).is_validation());
        assert!(TradewindError::UnknownStrategy("scalper".into()).is_validation());
        assert!(!TradewindError::Internal("bad state".into()).is_validation());
    }
}
