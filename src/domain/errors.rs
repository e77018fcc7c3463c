use crate::domain::types::OrderStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Engine-wide error taxonomy. Every business failure renders as a
/// single-line message suitable for direct display; system failures carry
/// the underlying diagnostic for the event sink only.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid order: {reason}")]
    Validation { reason: String },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient shares: owned {owned}, requested {requested}")]
    InsufficientShares { owned: Decimal, requested: Decimal },

    #[error("Current market price not available for {ticker_id}")]
    MarketPriceNotFound { ticker_id: String },

    #[error("Order not found")]
    OrderNotFound,

    #[error("Ticker not found: {ticker_id}")]
    TickerNotFound { ticker_id: String },

    #[error("Wallet not found for user")]
    WalletNotFound,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Cannot cancel order with status: {status}")]
    NotCancellable { status: OrderStatus },

    #[error("Order system error: {0}")]
    System(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        EngineError::Validation {
            reason: reason.into(),
        }
    }

    /// Business failures surface their message to users; system failures get
    /// a generic line while the full diagnostic goes to logs.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::System(_) => "Internal error, please retry later".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, EngineError::System(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::System(anyhow::Error::new(err).context("database failure"))
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::System(anyhow::Error::new(err).context("redis failure"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_business_errors_are_displayable() {
        let err = EngineError::InsufficientBalance {
            required: dec!(1001.00),
            available: dec!(500),
        };
        let msg = err.to_string();
        assert!(msg.contains("1001.00"));
        assert!(msg.contains("500"));
        assert_eq!(err.user_message(), msg);
    }

    #[test]
    fn test_system_errors_are_masked() {
        let err = EngineError::System(anyhow::anyhow!("connection refused on 5432"));
        assert!(err.is_system());
        assert!(!err.user_message().contains("5432"));
    }

    #[test]
    fn test_not_cancellable_names_status() {
        let err = EngineError::NotCancellable {
            status: OrderStatus::Filled,
        };
        assert!(err.to_string().contains("FILLED"));
    }
}
