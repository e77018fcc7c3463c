//! Trigger predicates for conditional orders and match planning for the
//! peer-to-peer Human-ETF book. All pure; the matcher loops feed in live
//! data and act on the outcomes.

use crate::domain::order::Order;
use crate::domain::types::{OrderSide, OrderType};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A limit order fills when the tape crosses its target.
/// BUY: target >= cur. SELL: target <= cur.
pub fn limit_triggered(side: OrderSide, target_price: Decimal, current: Decimal) -> bool {
    match side {
        OrderSide::Buy => target_price >= current,
        OrderSide::Sell => target_price <= current,
    }
}

/// A stop order fires when the tape trades through its stop.
/// BUY: cur >= stop. SELL: cur <= stop.
pub fn stop_triggered(side: OrderSide, stop_price: Decimal, current: Decimal) -> bool {
    match side {
        OrderSide::Buy => current >= stop_price,
        OrderSide::Sell => current <= stop_price,
    }
}

/// Re-verifies an order's own condition against a fresh tick. Used by the
/// matcher after re-reading the ledger row, guarding against cache drift.
pub fn is_triggered(order: &Order, current: Decimal) -> bool {
    match order.order_type {
        OrderType::Limit => order
            .target_price
            .is_some_and(|t| limit_triggered(order.side, t, current)),
        t if t.is_stop_family() => order
            .stop_price
            .is_some_and(|s| stop_triggered(order.side, s, current)),
        _ => false,
    }
}

/// Initial stop for a trailing order placed at `current`.
/// SELL trails below the market, BUY trails above it.
pub fn initial_trailing_stop(side: OrderSide, current: Decimal, gap: Decimal) -> Decimal {
    match side {
        OrderSide::Sell => current - gap,
        OrderSide::Buy => current + gap,
    }
}

/// Ratchet step for a resting trailing stop. Returns the improved stop, or
/// None when the tick does not move the stop in the protected direction.
pub fn next_trailing_stop(
    side: OrderSide,
    current: Decimal,
    gap: Decimal,
    stop_price: Decimal,
) -> Option<Decimal> {
    match side {
        OrderSide::Sell => {
            let candidate = current - gap;
            (candidate > stop_price).then_some(candidate)
        }
        OrderSide::Buy => {
            let candidate = current + gap;
            (candidate < stop_price).then_some(candidate)
        }
    }
}

/// One planned peer-to-peer fill.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPlan {
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Why no fill was planned this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatch {
    /// One side of the book is empty or prices do not cross.
    NoCross,
    /// Best buy and best sell are both MARKET; there is no reference price.
    MarketOnly,
}

fn buy_rank_price(order: &Order) -> Decimal {
    match order.order_type {
        OrderType::Market => Decimal::MAX,
        _ => order.target_price.unwrap_or(Decimal::ZERO),
    }
}

fn sell_rank_price(order: &Order) -> Decimal {
    match order.order_type {
        OrderType::Market => Decimal::ZERO,
        _ => order.target_price.unwrap_or(Decimal::MAX),
    }
}

/// Plans the next fill for one ticker's pending orders under price-time
/// priority: buys rank price-descending (MARKET first), sells rank
/// price-ascending (MARKET first), creation time breaks ties. When both
/// sides are LIMIT the older order is the maker and sets the price; a
/// MARKET side takes the LIMIT side's price.
pub fn plan_p2p_match(pending: &[Order]) -> Result<MatchPlan, NoMatch> {
    let mut buys: Vec<&Order> = pending
        .iter()
        .filter(|o| o.side == OrderSide::Buy)
        .collect();
    let mut sells: Vec<&Order> = pending
        .iter()
        .filter(|o| o.side == OrderSide::Sell)
        .collect();

    if buys.is_empty() || sells.is_empty() {
        return Err(NoMatch::NoCross);
    }

    buys.sort_by(|a, b| {
        buy_rank_price(b)
            .cmp(&buy_rank_price(a))
            .then(a.created_at.cmp(&b.created_at))
    });
    sells.sort_by(|a, b| {
        sell_rank_price(a)
            .cmp(&sell_rank_price(b))
            .then(a.created_at.cmp(&b.created_at))
    });

    let best_buy = buys[0];
    let best_sell = sells[0];

    if buy_rank_price(best_buy) < sell_rank_price(best_sell) {
        return Err(NoMatch::NoCross);
    }

    let price = match (best_buy.order_type, best_sell.order_type) {
        (OrderType::Market, OrderType::Market) => return Err(NoMatch::MarketOnly),
        (OrderType::Market, _) => best_sell.target_price,
        (_, OrderType::Market) => best_buy.target_price,
        // Maker wins: the older resting order sets the price.
        _ => {
            if best_buy.created_at < best_sell.created_at {
                best_buy.target_price
            } else {
                best_sell.target_price
            }
        }
    };
    let price = price.ok_or(NoMatch::NoCross)?;

    let quantity = best_buy.unfilled_quantity.min(best_sell.unfilled_quantity);
    if quantity <= Decimal::ZERO {
        return Err(NoMatch::NoCross);
    }

    Ok(MatchPlan {
        buy_order_id: best_buy.id,
        sell_order_id: best_sell.id,
        price,
        quantity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderRequest;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn order(
        side: OrderSide,
        order_type: OrderType,
        target: Option<Decimal>,
        qty: Decimal,
        age_secs: i64,
    ) -> Order {
        let req = OrderRequest {
            ticker_id: "HUMAN-a".to_string(),
            side,
            order_type,
            quantity: qty,
            target_price: target,
            stop_price: None,
            trailing_gap: None,
            idempotency_key: None,
        };
        let mut o = Order::pending(Uuid::new_v4(), Uuid::new_v4(), &req);
        o.created_at = Utc::now() - Duration::seconds(age_secs);
        o
    }

    #[test]
    fn test_limit_buy_triggers_at_or_below_target() {
        // A resting limit buy at 100 fills against any tape at or under it;
        // every tick of 110, 105, 101, 99 with target>=cur false/true:
        assert!(!limit_triggered(OrderSide::Buy, dec!(100), dec!(110)));
        assert!(!limit_triggered(OrderSide::Buy, dec!(100), dec!(105)));
        assert!(!limit_triggered(OrderSide::Buy, dec!(100), dec!(101)));
        assert!(limit_triggered(OrderSide::Buy, dec!(100), dec!(99)));
        assert!(limit_triggered(OrderSide::Buy, dec!(100), dec!(100)));
    }

    #[test]
    fn test_limit_sell_triggers_at_or_above_target() {
        assert!(limit_triggered(OrderSide::Sell, dec!(89), dec!(89)));
        assert!(limit_triggered(OrderSide::Sell, dec!(89), dec!(95)));
        assert!(!limit_triggered(OrderSide::Sell, dec!(89), dec!(88)));
    }

    #[test]
    fn test_stop_trigger_directions() {
        // Stop sell at 90 fires when the tape falls to it.
        assert!(stop_triggered(OrderSide::Sell, dec!(90), dec!(88)));
        assert!(stop_triggered(OrderSide::Sell, dec!(90), dec!(90)));
        assert!(!stop_triggered(OrderSide::Sell, dec!(90), dec!(91)));
        // Stop buy at 110 fires when the tape rises to it.
        assert!(stop_triggered(OrderSide::Buy, dec!(110), dec!(115)));
        assert!(!stop_triggered(OrderSide::Buy, dec!(110), dec!(109)));
    }

    #[test]
    fn test_trailing_stop_ratchet() {
        // SELL gap 5 placed at 100: stop 95. 110 raises it to 105,
        // 108 leaves it, 104 is at/below the stop (trigger path, not ratchet).
        assert_eq!(initial_trailing_stop(OrderSide::Sell, dec!(100), dec!(5)), dec!(95));
        assert_eq!(
            next_trailing_stop(OrderSide::Sell, dec!(110), dec!(5), dec!(95)),
            Some(dec!(105))
        );
        assert_eq!(
            next_trailing_stop(OrderSide::Sell, dec!(108), dec!(5), dec!(105)),
            None
        );
        assert!(stop_triggered(OrderSide::Sell, dec!(105), dec!(104)));
    }

    #[test]
    fn test_trailing_buy_ratchets_downward() {
        assert_eq!(initial_trailing_stop(OrderSide::Buy, dec!(100), dec!(5)), dec!(105));
        assert_eq!(
            next_trailing_stop(OrderSide::Buy, dec!(96), dec!(5), dec!(105)),
            Some(dec!(101))
        );
        assert_eq!(
            next_trailing_stop(OrderSide::Buy, dec!(99), dec!(5), dec!(101)),
            None
        );
    }

    #[test]
    fn test_p2p_fifo_among_equal_prices() {
        let b1 = order(OrderSide::Buy, OrderType::Limit, Some(dec!(100)), dec!(1), 20);
        let b2 = order(OrderSide::Buy, OrderType::Limit, Some(dec!(100)), dec!(1), 10);
        let s1 = order(OrderSide::Sell, OrderType::Limit, Some(dec!(100)), dec!(1), 5);

        let plan = plan_p2p_match(&[b2.clone(), s1.clone(), b1.clone()]).unwrap();
        assert_eq!(plan.buy_order_id, b1.id, "older buy must fill first");
        assert_eq!(plan.sell_order_id, s1.id);
        assert_eq!(plan.price, dec!(100));
        assert_eq!(plan.quantity, dec!(1));
    }

    #[test]
    fn test_p2p_maker_sets_price() {
        let buy = order(OrderSide::Buy, OrderType::Limit, Some(dec!(105)), dec!(2), 30);
        let sell = order(OrderSide::Sell, OrderType::Limit, Some(dec!(100)), dec!(2), 10);

        // The buy is older, so its limit is the match price.
        let plan = plan_p2p_match(&[buy.clone(), sell.clone()]).unwrap();
        assert_eq!(plan.price, dec!(105));

        // Reverse the ages and the sell's limit wins.
        let buy2 = order(OrderSide::Buy, OrderType::Limit, Some(dec!(105)), dec!(2), 10);
        let sell2 = order(OrderSide::Sell, OrderType::Limit, Some(dec!(100)), dec!(2), 30);
        let plan2 = plan_p2p_match(&[buy2, sell2]).unwrap();
        assert_eq!(plan2.price, dec!(100));
    }

    #[test]
    fn test_p2p_market_takes_limit_price() {
        let buy = order(OrderSide::Buy, OrderType::Market, None, dec!(3), 10);
        let sell = order(OrderSide::Sell, OrderType::Limit, Some(dec!(97)), dec!(2), 5);

        let plan = plan_p2p_match(&[buy, sell]).unwrap();
        assert_eq!(plan.price, dec!(97));
        assert_eq!(plan.quantity, dec!(2));
    }

    #[test]
    fn test_p2p_market_vs_market_is_skipped() {
        let buy = order(OrderSide::Buy, OrderType::Market, None, dec!(1), 10);
        let sell = order(OrderSide::Sell, OrderType::Market, None, dec!(1), 5);

        assert_eq!(plan_p2p_match(&[buy, sell]), Err(NoMatch::MarketOnly));
    }

    #[test]
    fn test_p2p_no_cross() {
        let buy = order(OrderSide::Buy, OrderType::Limit, Some(dec!(95)), dec!(1), 10);
        let sell = order(OrderSide::Sell, OrderType::Limit, Some(dec!(100)), dec!(1), 5);

        assert_eq!(plan_p2p_match(&[buy, sell]), Err(NoMatch::NoCross));
        assert_eq!(plan_p2p_match(&[]), Err(NoMatch::NoCross));
    }

    #[test]
    fn test_is_triggered_requires_price_fields() {
        let mut o = order(OrderSide::Buy, OrderType::Limit, None, dec!(1), 0);
        assert!(!is_triggered(&o, dec!(100)));

        o.target_price = Some(dec!(100));
        assert!(is_triggered(&o, dec!(99)));
        assert!(!is_triggered(&o, dec!(101)));
    }
}
