use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position magnitudes at or below this are flushed to zero after settlement.
pub const DUST_THRESHOLD: Decimal = dec!(0.00000001);

/// Net equity below `short_liability * MAINTENANCE_MARGIN_RATE` triggers
/// forced liquidation.
pub const MAINTENANCE_MARGIN_RATE: Decimal = dec!(0.05);

/// Fallback when `config:trading_fee_rate` is absent.
pub const DEFAULT_TRADING_FEE_RATE: Decimal = dec!(0.001);

// Wallet audit reasons (closed vocabulary, see wallet_transaction_history)
pub const WALLET_REASON_TRADE_BUY: &str = "trade:buy";
pub const WALLET_REASON_TRADE_SELL: &str = "trade:sell";
pub const WALLET_REASON_DIVIDEND: &str = "dividend";
pub const WALLET_REASON_LIQUIDATION_SETTLE: &str = "liquidation:settle";
pub const WALLET_REASON_LIQUIDATION_RESET: &str = "liquidation:reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("invalid order side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    /// Stop-market exit: fires a market order when the stop price trades through.
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    /// Take-profit market order, same trigger mechanics as StopLoss.
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    /// Stop that promotes to a resting LIMIT order when triggered.
    #[serde(rename = "STOP_LIMIT")]
    StopLimit,
    /// Stop price ratchets with the market by a fixed gap.
    #[serde(rename = "TRAILING_STOP")]
    TrailingStop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::StopLimit => "STOP_LIMIT",
            OrderType::TrailingStop => "TRAILING_STOP",
        }
    }

    /// Anything that rests in the order book waiting on a price condition.
    pub fn is_conditional(&self) -> bool {
        !matches!(self, OrderType::Market)
    }

    /// Orders indexed by stop_price rather than target_price.
    pub fn is_stop_family(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss | OrderType::TakeProfit | OrderType::StopLimit | OrderType::TrailingStop
        )
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            "STOP_LOSS" => Ok(OrderType::StopLoss),
            "TAKE_PROFIT" => Ok(OrderType::TakeProfit),
            "STOP_LIMIT" => Ok(OrderType::StopLimit),
            "TRAILING_STOP" => Ok(OrderType::TrailingStop),
            other => Err(format!("invalid order type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ACCEPTED")]
    Accepted,
    #[serde(rename = "TRIGGERED")]
    Triggered,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "FAILED")]
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::Triggered => "TRIGGERED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "ACCEPTED" => Ok(OrderStatus::Accepted),
            "TRIGGERED" => Ok(OrderStatus::Triggered),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(format!("invalid order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    #[serde(rename = "KRX")]
    Krx,
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "CRYPTO")]
    Crypto,
    /// User-issued instrument settled peer-to-peer, never against the tape.
    #[serde(rename = "HUMAN")]
    Human,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Krx => "KRX",
            MarketType::Us => "US",
            MarketType::Crypto => "CRYPTO",
            MarketType::Human => "HUMAN",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KRX" => Ok(MarketType::Krx),
            "US" => Ok(MarketType::Us),
            "CRYPTO" => Ok(MarketType::Crypto),
            "HUMAN" => Ok(MarketType::Human),
            other => Err(format!("invalid market type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "KRW")]
    Krw,
    #[serde(rename = "USD")]
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Krw => "KRW",
            Currency::Usd => "USD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KRW" => Ok(Currency::Krw),
            "USD" => Ok(Currency::Usd),
            other => Err(format!("invalid currency: {other}")),
        }
    }
}

/// True when a settled position magnitude should be flushed to zero.
pub fn is_dust(quantity: Decimal) -> bool {
    quantity.abs() <= DUST_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_type_classification() {
        assert!(!OrderType::Market.is_conditional());
        assert!(OrderType::Limit.is_conditional());
        assert!(OrderType::TrailingStop.is_conditional());

        assert!(!OrderType::Limit.is_stop_family());
        assert!(OrderType::StopLoss.is_stop_family());
        assert!(OrderType::TakeProfit.is_stop_family());
        assert!(OrderType::StopLimit.is_stop_family());
        assert!(OrderType::TrailingStop.is_stop_family());
    }

    #[test]
    fn test_enum_round_trips() {
        for s in ["BUY", "SELL"] {
            assert_eq!(OrderSide::from_str(s).unwrap().as_str(), s);
        }
        for s in [
            "MARKET",
            "LIMIT",
            "STOP_LOSS",
            "TAKE_PROFIT",
            "STOP_LIMIT",
            "TRAILING_STOP",
        ] {
            assert_eq!(OrderType::from_str(s).unwrap().as_str(), s);
        }
        for s in ["PENDING", "ACCEPTED", "TRIGGERED", "FILLED", "CANCELLED", "FAILED"] {
            assert_eq!(OrderStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(OrderSide::from_str("HOLD").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Triggered.is_terminal());
    }

    #[test]
    fn test_dust_threshold() {
        assert!(is_dust(dec!(0)));
        assert!(is_dust(dec!(0.00000001)));
        assert!(is_dust(dec!(-0.00000001)));
        assert!(!is_dust(dec!(0.00000002)));
        assert!(!is_dust(dec!(1)));
    }
}
