//! Position settlement math.
//!
//! Pure state-in/state-out computation for one execution against one
//! position. The executor runs this inside the ledger transaction and
//! persists the outcome; nothing here touches I/O.
//!
//! Sign conventions: `position_qty > 0` is long with `average_price` as the
//! acquisition cost per unit; `position_qty < 0` is short with
//! `average_price` as the short-entry credit per unit.

use crate::domain::errors::EngineError;
use crate::domain::types::{
    is_dust, OrderSide, WALLET_REASON_TRADE_BUY, WALLET_REASON_TRADE_SELL,
};
use rust_decimal::Decimal;

/// Snapshot of the state a fill settles against.
#[derive(Debug, Clone, Copy)]
pub struct SettlementInput {
    pub side: OrderSide,
    /// Execution price `p`.
    pub price: Decimal,
    /// Fill quantity `q`, always positive.
    pub quantity: Decimal,
    pub fee_rate: Decimal,
    /// Wallet balance pre-image.
    pub balance: Decimal,
    /// Current signed position quantity `cur`.
    pub position_qty: Decimal,
    /// Current average price `avg`.
    pub average_price: Decimal,
}

/// Everything the ledger must persist for one settled fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub fee: Decimal,
    /// Signed wallet delta, gross of any dividend withholding.
    pub wallet_delta: Decimal,
    pub wallet_reason: &'static str,
    pub new_quantity: Decimal,
    pub new_average_price: Decimal,
    /// Set iff this fill closed (part of) an opposite-sign position.
    pub realized_pnl: Option<Decimal>,
    /// The post-trade position is dust and its row must be removed.
    pub delete_position: bool,
}

/// Settles one fill. Fails only on a BUY funds shortfall; the caller marks
/// the order FAILED and commits nothing else.
pub fn settle(input: SettlementInput) -> Result<Settlement, EngineError> {
    let notional = input.price * input.quantity;
    let fee = notional * input.fee_rate;

    match input.side {
        OrderSide::Buy => settle_buy(input, notional, fee),
        OrderSide::Sell => Ok(settle_sell(input, notional, fee)),
    }
}

fn settle_buy(
    input: SettlementInput,
    notional: Decimal,
    fee: Decimal,
) -> Result<Settlement, EngineError> {
    let required = notional + fee;
    if input.balance < required {
        return Err(EngineError::InsufficientBalance {
            required,
            available: input.balance,
        });
    }

    let cur = input.position_qty;
    let q = input.quantity;

    // Closing part of a short realizes PnL against the short-entry credit.
    let realized_pnl = if cur < Decimal::ZERO {
        let closing = cur.abs().min(q);
        let allocated_fee = fee * closing / q;
        Some((input.average_price - input.price) * closing - allocated_fee)
    } else {
        None
    };

    let (new_quantity, new_average_price) = if cur >= Decimal::ZERO {
        // Extend long: the fee is folded into the acquisition cost.
        let new_qty = cur + q;
        let new_avg = (cur * input.average_price + required) / new_qty;
        (new_qty, new_avg)
    } else if cur + q <= Decimal::ZERO {
        // Reduce short, entry credit untouched.
        (cur + q, input.average_price)
    } else {
        // Switch short -> long: the surviving long was bought here.
        (cur + q, input.price)
    };

    Ok(Settlement {
        fee,
        wallet_delta: -required,
        wallet_reason: WALLET_REASON_TRADE_BUY,
        new_quantity,
        new_average_price,
        realized_pnl,
        delete_position: is_dust(new_quantity),
    })
}

fn settle_sell(input: SettlementInput, notional: Decimal, fee: Decimal) -> Settlement {
    let net_income = notional - fee;
    let cur = input.position_qty;
    let q = input.quantity;

    let realized_pnl = if cur > Decimal::ZERO {
        let closing = cur.min(q);
        let allocated_fee = fee * closing / q;
        Some((input.price - input.average_price) * closing - allocated_fee)
    } else {
        None
    };

    let (new_quantity, new_average_price) = if cur > Decimal::ZERO && cur - q >= Decimal::ZERO {
        // Reduce long, acquisition cost untouched.
        (cur - q, input.average_price)
    } else if cur > Decimal::ZERO {
        // Switch long -> short: the surviving short was sold here.
        (cur - q, input.price)
    } else {
        // Extend short: blend the proceeds into the entry credit.
        let prev_value = cur.abs() * input.average_price;
        let new_value = prev_value + net_income;
        let new_abs = (cur - q).abs();
        (cur - q, new_value / new_abs)
    };

    Settlement {
        fee,
        wallet_delta: net_income,
        wallet_reason: WALLET_REASON_TRADE_SELL,
        new_quantity,
        new_average_price,
        realized_pnl,
        delete_position: is_dust(new_quantity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input(
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        fee_rate: Decimal,
        balance: Decimal,
        pos_qty: Decimal,
        avg: Decimal,
    ) -> SettlementInput {
        SettlementInput {
            side,
            price,
            quantity: qty,
            fee_rate,
            balance,
            position_qty: pos_qty,
            average_price: avg,
        }
    }

    #[test]
    fn test_market_long_round_trip() {
        // Buy 10 @ 100, fee rate 0.001, starting balance 1,000,000.
        let buy = settle(input(
            OrderSide::Buy,
            dec!(100),
            dec!(10),
            dec!(0.001),
            dec!(1000000),
            dec!(0),
            dec!(0),
        ))
        .unwrap();

        assert_eq!(buy.fee, dec!(1));
        assert_eq!(buy.wallet_delta, dec!(-1001));
        assert_eq!(buy.wallet_reason, WALLET_REASON_TRADE_BUY);
        assert_eq!(buy.new_quantity, dec!(10));
        assert_eq!(buy.new_average_price, dec!(100.1));
        assert_eq!(buy.realized_pnl, None);
        assert!(!buy.delete_position);

        // Sell all 10 @ 120.
        let sell = settle(input(
            OrderSide::Sell,
            dec!(120),
            dec!(10),
            dec!(0.001),
            dec!(998999),
            dec!(10),
            dec!(100.1),
        ))
        .unwrap();

        assert_eq!(sell.fee, dec!(1.2));
        assert_eq!(sell.wallet_delta, dec!(1198.8));
        assert_eq!(sell.realized_pnl, Some(dec!(197.8)));
        assert_eq!(sell.new_quantity, dec!(0));
        assert!(sell.delete_position);
    }

    #[test]
    fn test_sell_switch_long_to_short() {
        // (+2 @ 100), sell 5 @ 100, zero fee.
        let s = settle(input(
            OrderSide::Sell,
            dec!(100),
            dec!(5),
            dec!(0),
            dec!(0),
            dec!(2),
            dec!(100),
        ))
        .unwrap();

        assert_eq!(s.wallet_delta, dec!(500));
        assert_eq!(s.realized_pnl, Some(dec!(0)));
        assert_eq!(s.new_quantity, dec!(-3));
        assert_eq!(s.new_average_price, dec!(100));
        assert!(!s.delete_position);
    }

    #[test]
    fn test_buy_switch_short_to_long() {
        // (-3 @ 100), buy 5 @ 90, zero fee. Closes 3 at +10 each.
        let s = settle(input(
            OrderSide::Buy,
            dec!(90),
            dec!(5),
            dec!(0),
            dec!(10000),
            dec!(-3),
            dec!(100),
        ))
        .unwrap();

        assert_eq!(s.realized_pnl, Some(dec!(30)));
        assert_eq!(s.new_quantity, dec!(2));
        assert_eq!(s.new_average_price, dec!(90));
    }

    #[test]
    fn test_buy_reduce_short_keeps_entry_credit() {
        let s = settle(input(
            OrderSide::Buy,
            dec!(95),
            dec!(4),
            dec!(0),
            dec!(10000),
            dec!(-10),
            dec!(100),
        ))
        .unwrap();

        // (100 - 95) * 4 = 20
        assert_eq!(s.realized_pnl, Some(dec!(20)));
        assert_eq!(s.new_quantity, dec!(-6));
        assert_eq!(s.new_average_price, dec!(100));
    }

    #[test]
    fn test_extend_short_blends_proceeds() {
        // (-10 @ 100), sell 10 more @ 90, zero fee.
        // prev value 1000, proceeds 900, new credit = 1900 / 20 = 95.
        let s = settle(input(
            OrderSide::Sell,
            dec!(90),
            dec!(10),
            dec!(0),
            dec!(0),
            dec!(-10),
            dec!(100),
        ))
        .unwrap();

        assert_eq!(s.realized_pnl, None);
        assert_eq!(s.new_quantity, dec!(-20));
        assert_eq!(s.new_average_price, dec!(95));
    }

    #[test]
    fn test_first_short_from_flat() {
        let s = settle(input(
            OrderSide::Sell,
            dec!(100),
            dec!(2),
            dec!(0.001),
            dec!(1000),
            dec!(0),
            dec!(0),
        ))
        .unwrap();

        // net income 200 - 0.2 spread over 2 units of credit.
        assert_eq!(s.new_quantity, dec!(-2));
        assert_eq!(s.new_average_price, dec!(99.9));
        assert_eq!(s.realized_pnl, None);
    }

    #[test]
    fn test_buy_shortfall_is_rejected() {
        let err = settle(input(
            OrderSide::Buy,
            dec!(100),
            dec!(10),
            dec!(0.001),
            dec!(1000),
            dec!(0),
            dec!(0),
        ))
        .unwrap_err();

        match err {
            EngineError::InsufficientBalance {
                required,
                available,
            } => {
                assert_eq!(required, dec!(1001));
                assert_eq!(available, dec!(1000));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_buy_wallet_delta_matches_invoice() {
        // For every committed BUY: delta = -(p*q*(1+f)), fee = p*q*f.
        let cases = [
            (dec!(100), dec!(10), dec!(0.001)),
            (dec!(19500), dec!(100), dec!(0.001)),
            (dec!(0.5), dec!(3), dec!(0.0025)),
        ];
        for (p, q, f) in cases {
            let s = settle(input(OrderSide::Buy, p, q, f, dec!(100000000), dec!(0), dec!(0)))
                .unwrap();
            assert_eq!(s.wallet_delta, -(p * q * (Decimal::ONE + f)));
            assert_eq!(s.fee, p * q * f);
            assert_eq!(s.new_quantity, q);
        }
    }

    #[test]
    fn test_sell_close_pnl_formula() {
        // Closing a long: delta = p*q*(1-f), pnl = (p-avg)*min(cur,q) - f*p*min(cur,q).
        let (p, q, f, cur, avg) = (dec!(120), dec!(4), dec!(0.002), dec!(9), dec!(100));
        let s = settle(input(OrderSide::Sell, p, q, f, dec!(0), cur, avg)).unwrap();

        let closing = cur.min(q);
        assert_eq!(s.wallet_delta, p * q * (Decimal::ONE - f));
        assert_eq!(
            s.realized_pnl,
            Some((p - avg) * closing - f * p * closing)
        );
        assert_eq!(s.new_quantity, cur - q);
        assert_eq!(s.new_average_price, avg);
    }

    #[test]
    fn test_dust_residue_is_flushed() {
        let s = settle(input(
            OrderSide::Sell,
            dec!(100),
            dec!(9.999999995),
            dec!(0),
            dec!(0),
            dec!(10),
            dec!(100),
        ))
        .unwrap();

        assert_eq!(s.new_quantity, dec!(0.000000005));
        assert!(s.delete_position);
    }

    #[test]
    fn test_conservation_under_zero_fee() {
        // Long<->long transfer between two users at one price moves value,
        // never creates it: cash delta of one side equals position value.
        let p = dec!(250);
        let q = dec!(4);

        let seller = settle(input(OrderSide::Sell, p, q, dec!(0), dec!(0), dec!(4), dec!(200)))
            .unwrap();
        let buyer = settle(input(OrderSide::Buy, p, q, dec!(0), dec!(10000), dec!(0), dec!(0)))
            .unwrap();

        assert_eq!(seller.wallet_delta + buyer.wallet_delta, dec!(0));
        assert_eq!(buyer.new_quantity * buyer.new_average_price, p * q);
    }
}
