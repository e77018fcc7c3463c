//! Net-equity assessment for short-position maintenance checks.

use crate::domain::asset::Position;
use crate::domain::types::MAINTENANCE_MARGIN_RATE;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Mark-to-market breakdown of a user's account.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquityBreakdown {
    pub long_value: Decimal,
    pub short_liability: Decimal,
    pub net_equity: Decimal,
}

/// Values every position at the current price, falling back to the position's
/// own average price when no quote is available.
pub fn assess_equity(
    balance: Decimal,
    positions: &[Position],
    prices: &HashMap<String, Decimal>,
) -> EquityBreakdown {
    let mut long_value = Decimal::ZERO;
    let mut short_liability = Decimal::ZERO;

    for position in positions {
        let price = prices
            .get(&position.ticker_id)
            .copied()
            .unwrap_or(position.average_price);
        let value = position.quantity * price;

        if position.quantity > Decimal::ZERO {
            long_value += value;
        } else {
            short_liability += value.abs();
        }
    }

    EquityBreakdown {
        long_value,
        short_liability,
        net_equity: balance + long_value - short_liability,
    }
}

/// Maintenance check: a shorted account must keep net equity at or above 5%
/// of its short liability. Accounts without shorts are never liquidated.
pub fn requires_liquidation(breakdown: &EquityBreakdown) -> bool {
    breakdown.short_liability > Decimal::ZERO
        && breakdown.net_equity < breakdown.short_liability * MAINTENANCE_MARGIN_RATE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn position(ticker: &str, qty: Decimal, avg: Decimal) -> Position {
        Position {
            user_id: Uuid::nil(),
            ticker_id: ticker.to_string(),
            quantity: qty,
            average_price: avg,
        }
    }

    #[test]
    fn test_margin_call_threshold() {
        // Wallet 2,000,000 with a -100 @ 10,000 short. Price rises to 19,500:
        // liability 1,950,000, equity 50,000, maintenance 97,500 -> liquidate.
        let positions = vec![position("CRYPTO-DOGE", dec!(-100), dec!(10000))];
        let mut prices = HashMap::new();
        prices.insert("CRYPTO-DOGE".to_string(), dec!(19500));

        let breakdown = assess_equity(dec!(2000000), &positions, &prices);
        assert_eq!(breakdown.short_liability, dec!(1950000));
        assert_eq!(breakdown.net_equity, dec!(50000));
        assert!(requires_liquidation(&breakdown));

        // At 19,000 the equity (100,000) clears maintenance (95,000).
        prices.insert("CRYPTO-DOGE".to_string(), dec!(19000));
        let ok = assess_equity(dec!(2000000), &positions, &prices);
        assert_eq!(ok.net_equity, dec!(100000));
        assert!(!requires_liquidation(&ok));
    }

    #[test]
    fn test_long_value_offsets_liability() {
        let positions = vec![
            position("US-AAPL", dec!(10), dec!(150)),
            position("CRYPTO-BTC", dec!(-1), dec!(40000)),
        ];
        let mut prices = HashMap::new();
        prices.insert("US-AAPL".to_string(), dec!(200));
        prices.insert("CRYPTO-BTC".to_string(), dec!(50000));

        let breakdown = assess_equity(dec!(1000), &positions, &prices);
        assert_eq!(breakdown.long_value, dec!(2000));
        assert_eq!(breakdown.short_liability, dec!(50000));
        assert_eq!(breakdown.net_equity, dec!(1000) + dec!(2000) - dec!(50000));
    }

    #[test]
    fn test_average_price_fallback() {
        let positions = vec![position("KRX-005930", dec!(-5), dec!(70000))];
        let breakdown = assess_equity(dec!(1000000), &positions, &HashMap::new());
        assert_eq!(breakdown.short_liability, dec!(350000));
    }

    #[test]
    fn test_no_shorts_never_liquidates() {
        let positions = vec![position("US-AAPL", dec!(1), dec!(100))];
        let breakdown = assess_equity(dec!(-500), &positions, &HashMap::new());
        assert!(!requires_liquidation(&breakdown));
    }
}
